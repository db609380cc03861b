//! CLI command modules.

pub mod conn;
pub mod keys;

use anyhow::Result;

use conn::Reply;

pub async fn cmd_ping(port: u16) -> Result<()> {
    let mut conn = conn::Connection::connect(port).await?;
    match conn.command(&["PING"]).await? {
        Reply::Simple(s) => println!("{s}"),
        Reply::Error(e) => println!("(error) {e}"),
        other => println!("{other:?}"),
    }
    Ok(())
}
