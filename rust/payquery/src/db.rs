use crate::config::AppConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use bb8::{ManageConnection, Pool};
use diesel_async::{AsyncPgConnection, SimpleAsyncConnection};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore};
use rustls_pemfile::certs;
use std::fs::File;
use std::io::BufReader;
use std::time::Duration;
use tokio_postgres::{Config as PgConfig, NoTls};
use tokio_postgres_rustls::MakeRustlsConnect;
use tracing::{error, info};

pub type PgPool = Pool<PgConnectionManager>;

/// Pools for the two execution paths. Freeform SQL never shares connections with
/// compiled plans.
#[derive(Clone)]
pub struct Pools {
    pub structured: PgPool,
    pub freeform: PgPool,
}

pub async fn connect_pools(config: &AppConfig) -> Result<Pools> {
    let structured = connect_pool(
        "structured",
        &config.database_url,
        config.max_pool_size,
        session_setup(config.request_timeout, false),
        config,
    )
    .await?;
    let freeform = connect_pool(
        "freeform",
        &config.readonly_database_url,
        config.readonly_max_pool_size,
        session_setup(config.request_timeout, true),
        config,
    )
    .await?;

    Ok(Pools {
        structured,
        freeform,
    })
}

fn session_setup(timeout: Duration, read_only: bool) -> String {
    let mut setup = format!("SET statement_timeout = {}", timeout.as_millis());
    if read_only {
        setup.push_str("; SET SESSION CHARACTERISTICS AS TRANSACTION READ ONLY");
    }
    setup
}

async fn connect_pool(
    label: &'static str,
    database_url: &str,
    max_size: u32,
    setup: String,
    config: &AppConfig,
) -> Result<PgPool> {
    let manager = PgConnectionManager::new(database_url, setup, TlsFiles::from_config(config))?;
    let pool = Pool::builder()
        .max_size(max_size)
        .connection_timeout(config.request_timeout)
        .build(manager)
        .await
        .with_context(|| format!("failed to build {label} PostgreSQL connection pool"))?;

    // Fail fast on bad credentials without refusing to boot.
    match pool.get().await {
        Ok(_) => info!(pool = label, max_size, "database connectivity check succeeded"),
        Err(err) => error!(pool = label, error = ?err, "initial database connectivity check failed"),
    }

    Ok(pool)
}

/// PEM paths for TLS to PostgreSQL. A root certificate switches TLS on.
#[derive(Debug, Clone, Copy, Default)]
struct TlsFiles<'a> {
    root: Option<&'a str>,
    cert: Option<&'a str>,
    key: Option<&'a str>,
}

impl<'a> TlsFiles<'a> {
    fn from_config(config: &'a AppConfig) -> Self {
        Self {
            root: config.pg_ssl_root_cert.as_deref(),
            cert: config.pg_ssl_cert.as_deref(),
            key: config.pg_ssl_key.as_deref(),
        }
    }

    fn connector(self) -> Result<Option<MakeRustlsConnect>> {
        let Some(root) = self.root else {
            if self.cert.is_some() || self.key.is_some() {
                anyhow::bail!("PGSSLCERT and PGSSLKEY require PGSSLROOTCERT");
            }
            return Ok(None);
        };

        let mut roots = RootCertStore::empty();
        for cert in read_certs(root, "PGSSLROOTCERT")? {
            roots
                .add(cert)
                .map_err(|_| anyhow::anyhow!("invalid certificate in PGSSLROOTCERT"))?;
        }

        let builder = ClientConfig::builder().with_root_certificates(roots);
        let client = match (self.cert, self.key) {
            (None, None) => builder.with_no_client_auth(),
            (Some(cert), Some(key)) => builder
                .with_client_auth_cert(read_certs(cert, "PGSSLCERT")?, read_key(key)?)
                .with_context(|| format!("failed to build client TLS config for {root}"))?,
            _ => anyhow::bail!("PGSSLCERT and PGSSLKEY must both be set (or neither)"),
        };
        Ok(Some(MakeRustlsConnect::new(client)))
    }
}

#[derive(Clone)]
pub struct PgConnectionManager {
    config: PgConfig,
    tls: Option<MakeRustlsConnect>,
    setup: String,
}

impl PgConnectionManager {
    fn new(database_url: &str, setup: String, tls: TlsFiles<'_>) -> Result<Self> {
        let config = database_url
            .parse::<PgConfig>()
            .context("invalid PAYQUERY_DATABASE_URL")?;
        Ok(Self {
            config,
            tls: tls.connector()?,
            setup,
        })
    }

    async fn open(&self) -> Result<AsyncPgConnection> {
        let conn = match &self.tls {
            None => {
                let (client, connection) = self.config.connect(NoTls).await?;
                AsyncPgConnection::try_from_client_and_connection(client, connection).await
            }
            Some(connector) => {
                let (client, connection) = self.config.connect(connector.clone()).await?;
                AsyncPgConnection::try_from_client_and_connection(client, connection).await
            }
        };
        conn.map_err(|err| anyhow::anyhow!(err))
    }
}

#[async_trait]
impl ManageConnection for PgConnectionManager {
    type Connection = AsyncPgConnection;
    type Error = anyhow::Error;

    async fn connect(&self) -> Result<Self::Connection, Self::Error> {
        let mut conn = self.open().await?;
        conn.batch_execute(&self.setup)
            .await
            .context("failed to apply session settings")?;
        Ok(conn)
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        conn.batch_execute("SELECT 1").await?;
        Ok(())
    }

    fn has_broken(&self, _: &mut Self::Connection) -> bool {
        false
    }
}

fn read_certs(path: &str, var: &str) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).with_context(|| format!("failed to open {var} file '{path}'"))?;
    let chain = certs(&mut BufReader::new(file))
        .collect::<std::result::Result<Vec<_>, _>>()
        .with_context(|| format!("failed to parse {var}"))?;
    if chain.is_empty() {
        anyhow::bail!("{var} contained no certificates");
    }
    Ok(chain)
}

fn read_key(path: &str) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path).with_context(|| format!("failed to open PGSSLKEY file '{path}'"))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .context("failed to parse PGSSLKEY")?
        .context("PGSSLKEY contained no private keys")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn freeform_sessions_are_read_only() {
        let setup = session_setup(Duration::from_secs(30), true);
        assert_eq!(
            setup,
            "SET statement_timeout = 30000; SET SESSION CHARACTERISTICS AS TRANSACTION READ ONLY"
        );
        assert_eq!(
            session_setup(Duration::from_millis(1500), false),
            "SET statement_timeout = 1500"
        );
    }

    #[test]
    fn tls_stays_off_without_a_root_certificate() {
        assert!(TlsFiles::default().connector().unwrap().is_none());

        let stray_key = TlsFiles {
            key: Some("/tmp/client.key"),
            ..TlsFiles::default()
        };
        assert!(stray_key.connector().is_err());
    }
}
