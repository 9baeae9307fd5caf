use snowplow_emitter::app::App;
use std::process::ExitCode;
use tracing::error;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let app = App::from_args(std::env::args_os())?;

    match app.run().await {
        Ok(summary) => {
            println!("{summary}");
            if summary.is_success() {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::FAILURE)
            }
        }
        Err(e) => {
            error!("Application error: {:#}", e);
            Err(e)
        }
    }
}
