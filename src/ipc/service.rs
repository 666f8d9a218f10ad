//! Unix-socket service exposing the cache to sibling processes.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{PgCache, ProxyRelocation};
use crate::error::{PgmError, Result};
use crate::ipc::codec::{payload_u64, read_frame, write_frame};
use crate::ipc::{
    PGM_IPC_DIAG_STATS, PGM_IPC_DIAG_STATS_RESULT, PGM_IPC_GROUP_STATUS,
    PGM_IPC_GROUP_STATUS_RESULT, PGM_IPC_HOST_PROXY, PGM_IPC_HOST_PROXY_RESULT,
    PGM_IPC_PROXY_RELOCATE,
};

pub struct PgmService {
    listener: UnixListener,
    path: PathBuf,
    cache: Arc<PgCache>,
    shutdown: CancellationToken,
}

impl PgmService {
    /// Binds the endpoint. Failure here is fatal to the process.
    pub fn bind(path: &Path, cache: Arc<PgCache>, shutdown: CancellationToken) -> Result<Self> {
        if path.exists() {
            std::fs::remove_file(path).map_err(PgmError::IpcInit)?;
        }
        let listener = UnixListener::bind(path).map_err(PgmError::IpcInit)?;
        info!(socket = %path.display(), "IPC service listening");
        Ok(Self {
            listener,
            path: path.to_owned(),
            cache,
            shutdown,
        })
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.accept_loop())
    }

    async fn accept_loop(self) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let cache = self.cache.clone();
                        let shutdown = self.shutdown.clone();
                        tokio::spawn(async move {
                            if let Err(err) = handle_client(stream, cache, shutdown).await {
                                debug!(error = %err, "IPC client failed");
                            }
                        });
                    }
                    Err(err) => warn!(error = %err, "IPC accept failed"),
                }
            }
        }
        let _ = std::fs::remove_file(&self.path);
        info!("IPC service stopped");
    }
}

async fn handle_client(
    mut stream: UnixStream,
    cache: Arc<PgCache>,
    shutdown: CancellationToken,
) -> Result<()> {
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            frame = read_frame(&mut stream) => frame?,
        };
        let Some(frame) = frame else {
            return Ok(());
        };

        match frame.code {
            PGM_IPC_PROXY_RELOCATE => {
                let event = ProxyRelocation {
                    proxyid: payload_u64(&frame.payload, 0)?,
                    srcid: payload_u64(&frame.payload, 8)?,
                    dstid: payload_u64(&frame.payload, 16)?,
                };
                debug!(
                    proxyid = event.proxyid,
                    srcid = event.srcid,
                    dstid = event.dstid,
                    "relocation event received"
                );
                cache.queue_relocation(event);
            }
            PGM_IPC_HOST_PROXY => {
                let hostid = payload_u64(&frame.payload, 0)?;
                let (proxyid, revision) = cache
                    .host_proxy(hostid)
                    .map(|mapping| (mapping.proxyid, mapping.revision))
                    .unwrap_or((0, 0));

                let mut payload = [0u8; 16];
                payload[0..8].copy_from_slice(&proxyid.to_le_bytes());
                payload[8..16].copy_from_slice(&revision.to_le_bytes());
                write_frame(&mut stream, PGM_IPC_HOST_PROXY_RESULT, &payload).await?;
            }
            PGM_IPC_GROUP_STATUS => {
                let group_id = payload_u64(&frame.payload, 0)?;
                let (status, status_time) = cache
                    .group_status(group_id)
                    .map(|(status, at)| (status.as_db() as u64, at))
                    .unwrap_or((0, 0));

                let mut payload = [0u8; 16];
                payload[0..8].copy_from_slice(&status.to_le_bytes());
                payload[8..16].copy_from_slice(&status_time.to_le_bytes());
                write_frame(&mut stream, PGM_IPC_GROUP_STATUS_RESULT, &payload).await?;
            }
            PGM_IPC_DIAG_STATS => {
                let stats = cache.stats();
                let mut payload = [0u8; 40];
                payload[0..8].copy_from_slice(&stats.groups.to_le_bytes());
                payload[8..16].copy_from_slice(&stats.proxies.to_le_bytes());
                payload[16..24].copy_from_slice(&stats.host_mappings.to_le_bytes());
                payload[24..32].copy_from_slice(&stats.queued_updates.to_le_bytes());
                payload[32..40].copy_from_slice(&stats.hpmap_revision.to_le_bytes());
                write_frame(&mut stream, PGM_IPC_DIAG_STATS_RESULT, &payload).await?;
            }
            other => {
                return Err(PgmError::IpcProtocol(format!(
                    "unsupported message code {other}"
                )));
            }
        }
    }
}
