use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    match cpra_filter::run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("cpra-filter: {e}");
            ExitCode::FAILURE
        }
    }
}
