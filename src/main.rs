use clap::Parser;
use tracing_subscriber::EnvFilter;

use tokenrelay::cli::{error_hint, Cli, CliHandler};
use tokenrelay::ui::UI;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("tokenrelay={}", log_level)));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut handler = CliHandler::with_config_path(cli.config);

    if let Err(e) = handler.execute(cli.command).await {
        let ui = UI::new();
        ui.error(&format!("Error: {}", e));
        if let Some(hint) = error_hint(&e) {
            ui.info(hint);
        }
        std::process::exit(1);
    }
}
