use anyhow::Result;
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions};

use crate::config::MySqlConfig;

/// Opens the MySQL connection pool used by both the archive and the query
/// history store.
pub async fn connect(conf: &MySqlConfig) -> Result<MySqlPool> {
    let options = MySqlConnectOptions::new()
        .host(&conf.host)
        .port(conf.port)
        .database(&conf.name)
        .username(&conf.user)
        .password(&conf.password);

    let pool = MySqlPoolOptions::new()
        .max_connections(conf.pool_size)
        .connect_with(options)
        .await?;

    Ok(pool)
}
