mod cli;
mod conf;

use human_panic::setup_panic;
use polyfmt::error;

#[tokio::main]
async fn main() {
    setup_panic!();

    if let Err(e) = cli::init().await {
        error!("{:?}", e);
        std::process::exit(1)
    }
}
