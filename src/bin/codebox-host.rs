use anyhow::Result;

fn main() -> Result<()> {
    codebox::cli::run(codebox::cli::CliMode::Host)
}
