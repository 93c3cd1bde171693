// One cooperative thread: pollers, remote calls and patches interleave, never run in parallel
#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    proxmigrate::cli::run().await
}
