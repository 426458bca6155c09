//! Disk health probe.
//!
//! Writes random bytes to a scratch file, reads them back and compares.
//! A timeout or mismatch means the disk is gone; the owner gets notified
//! through the failure callback and is expected to disable the location.

use std::alloc::Layout;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, format_err, Context, Error};
use rand::RngCore;

use dn_api_types::HealthCheckConfig;
use dn_tools::periodic::PeriodicTask;

use crate::io_pool::FifoPool;

pub const HEALTH_CHECK_FILE_NAME: &str = "health_check~";

/// Buffer aligned for direct I/O.
struct AlignedBuffer {
    ptr: *mut u8,
    layout: Layout,
}

unsafe impl Send for AlignedBuffer {}

impl AlignedBuffer {
    fn new(size: usize) -> Self {
        let layout = Layout::from_size_align(size, 4096).expect("bad probe buffer layout");
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        assert!(!ptr.is_null());
        Self { ptr, layout }
    }

    fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.layout.size()) }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.layout.size()) }
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        unsafe { std::alloc::dealloc(self.ptr, self.layout) };
    }
}

pub struct DiskHealthChecker {
    config: HealthCheckConfig,
    path: PathBuf,
    pool: Arc<FifoPool>,
}

impl DiskHealthChecker {
    pub fn new(config: HealthCheckConfig, path: &Path, pool: Arc<FifoPool>) -> Arc<Self> {
        Arc::new(Self {
            config,
            path: path.to_owned(),
            pool,
        })
    }

    /// One probe with the configured timeout.
    pub async fn run_check(self: &Arc<Self>) -> Result<(), Error> {
        let this = Arc::clone(self);
        let check = self.pool.submit(move || this.do_run_check());
        match tokio::time::timeout(self.config.timeout, check).await {
            Ok(result) => result,
            Err(_) => bail!("disk health check timed out at {:?}", self.path),
        }
    }

    /// Start periodic checking; `on_failed` fires once on the first failed
    /// probe.
    pub fn start<F>(self: &Arc<Self>, on_failed: F) -> PeriodicTask
    where
        F: Fn(Error) + Send + Sync + 'static,
    {
        let this = Arc::clone(self);
        let on_failed = Arc::new(on_failed);
        PeriodicTask::spawn("disk-health-check", self.config.check_period, move || {
            let this = Arc::clone(&this);
            let on_failed = Arc::clone(&on_failed);
            async move {
                if let Err(err) = this.run_check().await {
                    log::error!("disk health check failed at {:?} - {err:#}", this.path);
                    on_failed(err);
                }
            }
        })
    }

    fn do_run_check(&self) -> Result<(), Error> {
        log::debug!("disk health check started at {:?}", self.path);

        let size = self.config.test_size;
        let mut write_data = AlignedBuffer::new(size);
        let mut read_data = AlignedBuffer::new(size);
        rand::thread_rng().fill_bytes(write_data.as_mut_slice());

        let probe_path = self.path.join(HEALTH_CHECK_FILE_NAME);

        let result = (|| -> Result<(), Error> {
            {
                let mut file = self.open_probe(&probe_path, true)?;
                file.write_all(write_data.as_slice())
                    .context("probe write failed")?;
            }
            {
                let mut file = self.open_probe(&probe_path, false)?;
                let len = file.metadata().context("probe stat failed")?.len();
                if len != size as u64 {
                    bail!("wrong probe file size: {len} instead of {size}");
                }
                file.read_exact(read_data.as_mut_slice())
                    .context("probe read failed")?;
            }

            std::fs::remove_file(&probe_path).context("probe cleanup failed")?;

            if write_data.as_slice() != read_data.as_slice() {
                bail!("probe file is corrupt");
            }
            Ok(())
        })();

        result.map_err(|err| format_err!("disk health check failed at {:?} - {err}", self.path))?;

        log::debug!("disk health check finished at {:?}", self.path);
        Ok(())
    }

    fn open_probe(&self, path: &Path, write: bool) -> Result<std::fs::File, Error> {
        if self.config.use_direct_io {
            dn_tools::fs::open_direct(path, write)
        } else if write {
            std::fs::File::create(path).map_err(Error::from)
        } else {
            std::fs::File::open(path).map_err(Error::from)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn test_config() -> HealthCheckConfig {
        HealthCheckConfig {
            check_period: std::time::Duration::from_secs(60),
            timeout: std::time::Duration::from_secs(10),
            test_size: 8192,
            use_direct_io: false,
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_health_check_roundtrip() {
        let dir = std::env::temp_dir().join(format!("dn-health-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let pool = Arc::new(FifoPool::new("health-test", 1));
        let checker = DiskHealthChecker::new(test_config(), &dir, pool);
        checker.run_check().await.unwrap();
        assert!(!dir.join(HEALTH_CHECK_FILE_NAME).exists());

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_health_check_missing_dir_fails() {
        let dir = std::env::temp_dir().join("dn-health-test-does-not-exist");
        let pool = Arc::new(FifoPool::new("health-test", 1));
        let checker = DiskHealthChecker::new(test_config(), &dir, pool);
        assert!(checker.run_check().await.is_err());
    }
}
