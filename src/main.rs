#[tokio::main]
async fn main() {
    waflow_server::app::run().await;
}
