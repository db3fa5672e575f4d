use anyhow::Result;

fn main() -> Result<()> {
    modguard::run()?;
    Ok(())
}
