use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    codeprompt_cli::main_entry().await
}
