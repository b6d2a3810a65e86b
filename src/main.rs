use drift::server;

#[tokio::main]
async fn main() {
    server::run().await;
}
