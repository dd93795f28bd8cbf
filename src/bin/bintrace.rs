use anyhow::Result;

fn main() -> Result<()> {
    bintrace::cli::run()
}
