use std::fs::File;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use anyhow::Context as _;
use tempfile::TempDir;

use super::port::get_available_port;

/// The `billing_server` binary running against its own temp database.
pub struct BillingServerProcess {
    temp_dir: Option<TempDir>,
    base_url: String,
    db_path: PathBuf,
    child: Child,
    log_path: PathBuf,
}

impl BillingServerProcess {
    pub fn start(provider_url: &str, private_key: &str, extra_env: &[(&str, &str)]) -> anyhow::Result<Self> {
        let temp_dir = tempfile::tempdir().context("create billing-server tempdir")?;
        let root_dir = temp_dir.path().to_path_buf();

        let port = get_available_port().context("select billing-server port")?;
        let listen_addr = format!("127.0.0.1:{port}");
        let db_path = root_dir.join("billing.sqlite3");

        let log_path = root_dir.join("billing-server.log");
        let log = File::create(&log_path).context("create billing-server log")?;
        let log_err = log.try_clone().context("clone billing-server log")?;

        let mut cmd = Command::new(env!("CARGO_BIN_EXE_billing_server"));
        cmd.env_remove("ORDER_SERVICE_URL")
            .env("RUST_LOG", "debug")
            .env("BILLING_LISTEN_ADDR", &listen_addr)
            .env("BILLING_DB_PATH", &db_path)
            .env("PAYMENT_PROVIDER_BASE_URL", provider_url)
            .env("PAYMENT_PROVIDER_API_KEY", "api-key")
            .env("PAYMENT_PROVIDER_PRIVATE_KEY", private_key)
            .env("PAYMENT_PROVIDER_MERCHANT_CODE", "T0001")
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));
        for (key, value) in extra_env {
            cmd.env(key, value);
        }
        let child = cmd.spawn().context("spawn billing_server")?;

        Ok(Self {
            temp_dir: Some(temp_dir),
            base_url: format!("http://{listen_addr}"),
            db_path,
            child,
            log_path,
        })
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    pub fn db_path(&self) -> &PathBuf {
        &self.db_path
    }

    pub async fn wait_ready(&mut self, timeout: Duration) -> anyhow::Result<()> {
        let deadline = Instant::now() + timeout;
        let client = reqwest::Client::new();

        loop {
            if let Some(status) = self.child.try_wait().context("poll billing-server status")? {
                anyhow::bail!(
                    "billing_server exited early with status {status} (log={})",
                    self.log_path.display()
                );
            }

            let ready = client
                .get(self.url("/wallets/readiness-probe"))
                .send()
                .await
                .is_ok_and(|resp| resp.status().is_success());
            if ready {
                return Ok(());
            }

            if Instant::now() >= deadline {
                anyhow::bail!(
                    "timeout waiting for billing_server readiness (log={})",
                    self.log_path.display()
                );
            }

            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

impl Drop for BillingServerProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();

        if (should_keep_artifacts() || std::thread::panicking())
            && let Some(temp_dir) = self.temp_dir.take()
        {
            let _ = temp_dir.keep();
        }
    }
}

fn should_keep_artifacts() -> bool {
    matches!(
        std::env::var("KEEP_BILLING_E2E_ARTIFACTS")
            .unwrap_or_default()
            .to_ascii_lowercase()
            .as_str(),
        "1" | "true" | "yes"
    )
}
