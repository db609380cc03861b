//! GET/SET/DEL subcommands.

use anyhow::Result;

use super::conn::{Connection, Reply};

pub async fn cmd_get(port: u16, key: &str) -> Result<()> {
    let mut conn = Connection::connect(port).await?;
    match conn.command(&["GET", key]).await? {
        Reply::Bulk(value) => println!("{value}"),
        Reply::Nil => println!("(nil)"),
        Reply::Error(e) => println!("(error) {e}"),
        other => println!("{other:?}"),
    }
    Ok(())
}

pub async fn cmd_set(port: u16, key: &str, value: &str, px_ms: Option<&str>) -> Result<()> {
    let mut conn = Connection::connect(port).await?;
    let mut parts = vec!["SET", key, value];
    if let Some(px) = px_ms {
        parts.push("PX");
        parts.push(px);
    }
    match conn.command(&parts).await? {
        Reply::Simple(s) => println!("{s}"),
        Reply::Error(e) => println!("(error) {e}"),
        other => println!("{other:?}"),
    }
    Ok(())
}

pub async fn cmd_del(port: u16, keys: &[String]) -> Result<()> {
    let mut conn = Connection::connect(port).await?;
    let mut parts = vec!["DEL".to_string()];
    parts.extend(keys.iter().cloned());
    let parts: Vec<&str> = parts.iter().map(String::as_str).collect();
    match conn.command(&parts).await? {
        Reply::Integer(n) => println!("(integer) {n}"),
        Reply::Error(e) => println!("(error) {e}"),
        other => println!("{other:?}"),
    }
    Ok(())
}
