//! Notification Worker - Entry Point
//!
//! Dispatches queued ERP notifications to their channels.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    erp_notification_worker::run().await
}
