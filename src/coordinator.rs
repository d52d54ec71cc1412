use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use derive_builder::Builder;
use futures::future::join_all;
use reqwest::{Client, Url};
use tokio_util::sync::CancellationToken;

use crate::config::DownloadConfig;
use crate::error::DlmError;
use crate::metadata::Metadata;
use crate::urls;
use crate::worker::RangeWorker;
use crate::writer::FileWriter;

/// Supervises one download: probes the file size, partitions the byte range
/// across range workers, wires them to the single writer through the bounded
/// queue, and decides whether the run succeeded.
#[derive(Builder, Debug)]
#[builder(build_fn(validate = "Self::validate"))]
pub struct Downloader {
    /// Mirror urls; worker `k` uses `urls[k % urls.len()]`.
    urls: Vec<Url>,
    /// Requested number of parallel connections. Clamped so that every
    /// connection is worth at least `min_bytes_per_connection`.
    #[builder(default = 1)]
    max_connections: u64,
    /// Where to save the file. Derived from the first url and the working
    /// directory when not set.
    #[builder(default = None)]
    dest_path: Option<PathBuf>,
    #[builder(default)]
    config: DownloadConfig,
}

impl Downloader {
    pub async fn run(&self) -> Result<(), DlmError> {
        let cfg = &self.config;
        let client = Client::builder()
            .connect_timeout(cfg.connect_timeout())
            .read_timeout(cfg.read_timeout())
            .build()?;

        let content_length = probe_content_length(&client, &self.urls[0]).await?;

        let chunk_count = content_length.div_ceil(cfg.chunk_size);
        let n = limit_connections(
            content_length,
            self.max_connections,
            cfg.min_bytes_per_connection,
        )
        .min(chunk_count);

        if n > 1 {
            println!("Downloading using {n} connections...");
        } else {
            println!("Downloading...");
        }

        let dest = match &self.dest_path {
            Some(path) => path.clone(),
            None => urls::dest_path(&self.urls[0])?,
        };

        let metadata = Metadata::load_or_new(&dest, chunk_count).await;
        let bitmap = Arc::new(metadata.snapshot_bitmap());
        let writer = FileWriter::create(dest.clone(), metadata, cfg.chunk_wait_timeout()).await?;

        let (tx, rx) = async_channel::bounded(cfg.queue_capacity);
        let cancel = CancellationToken::new();
        let mut handles = Vec::with_capacity(n as usize + 1);

        for plan in plan_workers(chunk_count, content_length, cfg.chunk_size, n, &bitmap) {
            let worker = RangeWorker {
                id: plan.id,
                url: self.urls[plan.id % self.urls.len()].clone(),
                range_start: plan.range_start,
                range_end: plan.range_end,
                chunks: plan.chunks,
                is_last: plan.is_last,
                chunk_size: cfg.chunk_size,
                bitmap: Arc::clone(&bitmap),
                client: client.clone(),
                tx: tx.clone(),
            };
            handles.push(spawn_supervised(worker.run(), cancel.clone()));
        }
        // The writer must see the channel close if every producer is gone.
        drop(tx);

        handles.push(spawn_supervised(writer.run(rx), cancel.clone()));

        let results = match tokio::time::timeout(cfg.run_timeout(), join_all(handles)).await {
            Ok(results) => results,
            Err(_) => {
                cancel.cancel();
                return Err(DlmError::RunTimeout);
            }
        };

        let mut failure: Option<DlmError> = None;
        for res in results {
            let outcome = match res {
                Ok(outcome) => outcome,
                Err(join_err) => Err(join_err.into()),
            };
            if let Err(e) = outcome {
                let more_specific = match &failure {
                    None => true,
                    Some(DlmError::Interrupted) => !matches!(e, DlmError::Interrupted),
                    Some(_) => false,
                };
                if more_specific {
                    failure = Some(e);
                }
            }
        }
        if let Some(e) = failure {
            return Err(e);
        }

        Metadata::remove(&dest).await?;
        Ok(())
    }
}

impl DownloaderBuilder {
    fn validate(&self) -> Result<(), DownloaderBuilderError> {
        if self.urls.as_ref().is_none_or(|u| u.is_empty()) {
            return Err(DownloaderBuilderError::ValidationError(
                "at least one url is required".to_string(),
            ));
        }
        if let Some(0) = self.max_connections {
            return Err(DownloaderBuilderError::ValidationError(
                "max_connections must be at least 1".to_string(),
            ));
        }
        if let Some(cfg) = &self.config {
            if cfg.chunk_size == 0 || !cfg.chunk_size.is_power_of_two() {
                return Err(DownloaderBuilderError::ValidationError(
                    "chunk_size must be a power of two".to_string(),
                ));
            }
            if cfg.queue_capacity == 0 {
                return Err(DownloaderBuilderError::ValidationError(
                    "queue_capacity must be at least 1".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// One range worker's share of the file, after resume trimming.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct WorkerPlan {
    pub(crate) id: usize,
    pub(crate) range_start: u64,
    pub(crate) range_end: u64,
    pub(crate) chunks: u64,
    pub(crate) is_last: bool,
}

/// Split `chunk_count` chunks over `n` workers. Worker `k` gets
/// `chunk_count / n` chunks starting at `k * (chunk_count / n)`; the last
/// worker also takes the remainder and the file's final (possibly short)
/// bytes. Each partition's start is then advanced over the prefix of chunks
/// the bitmap already has, so a resumed run never re-requests them. Interior
/// holes stay inside the range and are skipped by the worker.
pub(crate) fn plan_workers(
    chunk_count: u64,
    content_length: u64,
    chunk_size: u64,
    n: u64,
    bitmap: &[bool],
) -> Vec<WorkerPlan> {
    let chunks_per_worker = chunk_count / n;
    let mut plans = Vec::with_capacity(n as usize);
    let mut range_start = 0u64;

    for k in 0..n {
        let is_last = k == n - 1;
        let mut range_end = range_start + chunks_per_worker * chunk_size - 1;
        let mut chunks = chunks_per_worker;
        if is_last {
            chunks = chunk_count - k * chunks_per_worker;
            range_end = content_length - 1;
        }
        let next_start = range_end + 1;

        let mut bounded_start = range_start;
        let mut idx = range_start / chunk_size;
        while chunks > 0 && bitmap[idx as usize] {
            bounded_start += chunk_size;
            chunks -= 1;
            idx += 1;
        }

        plans.push(WorkerPlan {
            id: k as usize,
            range_start: bounded_start,
            range_end,
            chunks,
            is_last,
        });
        range_start = next_start;
    }

    plans
}

/// Limit the connection count so every worker fetches at least
/// `min_bytes_per_connection`. A tiny file is still worth one connection.
fn limit_connections(content_length: u64, requested: u64, min_bytes_per_connection: u64) -> u64 {
    if content_length / requested > min_bytes_per_connection {
        return requested;
    }

    let limited = (content_length / min_bytes_per_connection).max(1);
    println!(
        "Minimum range per connection is {}MB",
        min_bytes_per_connection / (1000 * 1024)
    );
    println!("Optimizing connections number to {limited}");
    limited
}

/// Single GET to learn the file size. The body is not read.
async fn probe_content_length(client: &Client, url: &Url) -> Result<u64, DlmError> {
    let resp = client.get(url.clone()).send().await?.error_for_status()?;
    tracing::debug!(status = %resp.status(), "probe response");
    match resp.content_length() {
        Some(len) if len > 0 => Ok(len),
        _ => Err(DlmError::UnknownContentLength),
    }
}

/// Run a worker future under the shared cancellation token. The first
/// failing worker cancels the token; everyone else unwinds with
/// `Interrupted` at their next suspension point, and the coordinator reports
/// the original error.
fn spawn_supervised<F>(
    fut: F,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<Result<(), DlmError>>
where
    F: Future<Output = Result<(), DlmError>> + Send + 'static,
{
    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => Err(DlmError::Interrupted),
            res = fut => {
                if res.is_err() {
                    cancel.cancel();
                }
                res
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NetworkError;
    use crate::metadata::sidecar_path;
    use mockito::{Matcher, Server, ServerGuard};
    use tempfile::tempdir;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn limit_keeps_requested_count_for_large_files() {
        assert_eq!(limit_connections(100 * MIB, 4, MIB), 4);
    }

    #[test]
    fn limit_clamps_to_size_over_minimum() {
        // 3 MiB over 8 requested connections is under the 1 MiB floor.
        assert_eq!(limit_connections(3 * MIB, 8, MIB), 3);
    }

    #[test]
    fn limit_raises_zero_quotient_to_one() {
        assert_eq!(limit_connections(500_000, 10, MIB), 1);
    }

    #[test]
    fn limit_applies_at_exact_boundary() {
        // content_length / n equal to the floor clamps too.
        assert_eq!(limit_connections(4 * MIB, 4, MIB), 4 * MIB / MIB);
    }

    #[test]
    fn plan_splits_three_mib_across_three_workers() {
        let chunk_size = 64 * 1024;
        let content_length = 3 * MIB;
        let chunk_count = 48;
        let plans = plan_workers(
            chunk_count,
            content_length,
            chunk_size,
            3,
            &vec![false; 48],
        );

        assert_eq!(plans.len(), 3);
        assert_eq!(
            plans[0],
            WorkerPlan {
                id: 0,
                range_start: 0,
                range_end: 1_048_575,
                chunks: 16,
                is_last: false
            }
        );
        assert_eq!(plans[1].range_start, 1_048_576);
        assert_eq!(plans[1].range_end, 2_097_151);
        assert_eq!(
            plans[2],
            WorkerPlan {
                id: 2,
                range_start: 2_097_152,
                range_end: 3_145_727,
                chunks: 16,
                is_last: true
            }
        );
    }

    #[test]
    fn plan_last_worker_takes_remainder_and_short_tail() {
        // 100_000 bytes in 64 KiB chunks: two chunks, one short.
        let plans = plan_workers(2, 100_000, 64 * 1024, 1, &[false, false]);
        assert_eq!(
            plans[0],
            WorkerPlan {
                id: 0,
                range_start: 0,
                range_end: 99_999,
                chunks: 2,
                is_last: true
            }
        );
    }

    #[test]
    fn plan_trims_done_prefix_but_not_interior_holes() {
        // 10 chunks of 64 KiB, chunks 0,1,2,5 already on disk, two workers.
        let mut bitmap = vec![false; 10];
        for i in [0usize, 1, 2, 5] {
            bitmap[i] = true;
        }
        let chunk_size = 64 * 1024;
        let plans = plan_workers(10, 10 * chunk_size, chunk_size, 2, &bitmap);

        // Worker 0 starts at chunk 3 and still owns chunk 4.
        assert_eq!(plans[0].range_start, 196_608);
        assert_eq!(plans[0].range_end, 327_679);
        assert_eq!(plans[0].chunks, 2);

        // Worker 1's own prefix (chunk 5) is trimmed away.
        assert_eq!(plans[1].range_start, 393_216);
        assert_eq!(plans[1].range_end, 655_359);
        assert_eq!(plans[1].chunks, 4);
    }

    #[test]
    fn plan_for_fully_done_partition_is_empty() {
        let bitmap = vec![true; 10];
        let chunk_size = 64 * 1024;
        let plans = plan_workers(10, 10 * chunk_size, chunk_size, 2, &bitmap);
        for plan in &plans {
            assert_eq!(plan.chunks, 0);
            assert!(plan.range_start > plan.range_end);
        }
    }

    #[test]
    fn builder_rejects_zero_connections() {
        let err = DownloaderBuilder::default()
            .urls(vec![Url::parse("http://example.com/f").unwrap()])
            .max_connections(0)
            .build();
        assert!(err.is_err());
    }

    #[test]
    fn builder_rejects_non_power_of_two_chunk_size() {
        let mut cfg = DownloadConfig::default();
        cfg.chunk_size = 1000;
        let err = DownloaderBuilder::default()
            .urls(vec![Url::parse("http://example.com/f").unwrap()])
            .config(cfg)
            .build();
        assert!(err.is_err());
    }

    fn test_config(chunk_size: u64) -> DownloadConfig {
        let mut cfg = DownloadConfig::default();
        cfg.chunk_size = chunk_size;
        cfg.queue_capacity = 16;
        cfg.min_bytes_per_connection = 1;
        cfg.chunk_wait_timeout_secs = 5.0;
        cfg.run_timeout_secs = 30.0;
        cfg
    }

    async fn mount_probe(server: &mut ServerGuard, body: &[u8]) -> mockito::Mock {
        server
            .mock("GET", "/f.bin")
            .match_header("range", Matcher::Missing)
            .with_status(200)
            .with_body(body.to_vec())
            .create_async()
            .await
    }

    async fn mount_range(server: &mut ServerGuard, range: &str, body: &[u8]) -> mockito::Mock {
        server
            .mock("GET", "/f.bin")
            .match_header("range", Matcher::Exact(range.to_string()))
            .with_status(206)
            .with_body(body.to_vec())
            .create_async()
            .await
    }

    #[tokio::test]
    async fn fresh_download_with_one_connection() {
        let body: Vec<u8> = (0u8..20).collect();
        let mut server = Server::new_async().await;
        let probe = mount_probe(&mut server, &body).await;
        let range = mount_range(&mut server, "bytes=0-19", &body).await;

        let dir = tempdir().unwrap();
        let dest = dir.path().join("f.bin");
        let dl = DownloaderBuilder::default()
            .urls(vec![Url::parse(&format!("{}/f.bin", server.url())).unwrap()])
            .max_connections(1)
            .dest_path(Some(dest.clone()))
            .config(test_config(8))
            .build()
            .unwrap();

        dl.run().await.unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), body);
        assert!(!sidecar_path(&dest).exists());
        probe.assert_async().await;
        range.assert_async().await;
    }

    #[tokio::test]
    async fn multi_connection_download_covers_all_partitions() {
        let body: Vec<u8> = (0u8..24).collect();
        let mut server = Server::new_async().await;
        mount_probe(&mut server, &body).await;
        let r0 = mount_range(&mut server, "bytes=0-7", &body[0..8]).await;
        let r1 = mount_range(&mut server, "bytes=8-15", &body[8..16]).await;
        let r2 = mount_range(&mut server, "bytes=16-23", &body[16..24]).await;

        let dir = tempdir().unwrap();
        let dest = dir.path().join("f.bin");
        let dl = DownloaderBuilder::default()
            .urls(vec![Url::parse(&format!("{}/f.bin", server.url())).unwrap()])
            .max_connections(3)
            .dest_path(Some(dest.clone()))
            .config(test_config(4))
            .build()
            .unwrap();

        dl.run().await.unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), body);
        assert!(!sidecar_path(&dest).exists());
        r0.assert_async().await;
        r1.assert_async().await;
        r2.assert_async().await;
    }

    #[tokio::test]
    async fn resume_fetches_only_missing_chunks() {
        let body: Vec<u8> = (0u8..40).collect();
        let mut server = Server::new_async().await;
        mount_probe(&mut server, &body).await;
        // Worker 0 resumes at chunk 3; worker 1 resumes past chunk 5.
        let r0 = mount_range(&mut server, "bytes=12-19", &body[12..20]).await;
        let r1 = mount_range(&mut server, "bytes=24-39", &body[24..40]).await;

        let dir = tempdir().unwrap();
        let dest = dir.path().join("f.bin");

        // Seed the previous run's progress: chunks 0,1,2,5 of 10 are done.
        let mut seeded = vec![b'_'; 40];
        for i in [0usize, 1, 2, 5] {
            seeded[i * 4..(i + 1) * 4].copy_from_slice(&body[i * 4..(i + 1) * 4]);
        }
        std::fs::write(&dest, &seeded).unwrap();
        let mut meta = Metadata::new(10);
        for i in [0u64, 1, 2, 5] {
            meta.mark(i);
        }
        meta.persist(&dest).await.unwrap();

        let dl = DownloaderBuilder::default()
            .urls(vec![Url::parse(&format!("{}/f.bin", server.url())).unwrap()])
            .max_connections(2)
            .dest_path(Some(dest.clone()))
            .config(test_config(4))
            .build()
            .unwrap();

        dl.run().await.unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), body);
        assert!(!sidecar_path(&dest).exists());
        r0.assert_async().await;
        r1.assert_async().await;
    }

    #[tokio::test]
    async fn completed_sidecar_makes_rerun_a_noop() {
        let body: Vec<u8> = (0u8..16).collect();
        let mut server = Server::new_async().await;
        let probe = mount_probe(&mut server, &body).await;
        // No range mocks: any range request would 501 and fail the run.

        let dir = tempdir().unwrap();
        let dest = dir.path().join("f.bin");
        std::fs::write(&dest, &body).unwrap();
        let mut meta = Metadata::new(4);
        for i in 0..4 {
            meta.mark(i);
        }
        meta.persist(&dest).await.unwrap();

        let dl = DownloaderBuilder::default()
            .urls(vec![Url::parse(&format!("{}/f.bin", server.url())).unwrap()])
            .max_connections(2)
            .dest_path(Some(dest.clone()))
            .config(test_config(4))
            .build()
            .unwrap();

        dl.run().await.unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), body);
        assert!(!sidecar_path(&dest).exists());
        probe.assert_async().await;
    }

    #[tokio::test]
    async fn mirrors_rotate_across_workers() {
        let body: Vec<u8> = (0u8..16).collect();
        let mut server_a = Server::new_async().await;
        let mut server_b = Server::new_async().await;
        mount_probe(&mut server_a, &body).await;
        let on_a = mount_range(&mut server_a, "bytes=0-7", &body[0..8]).await;
        let on_b = mount_range(&mut server_b, "bytes=8-15", &body[8..16]).await;

        let dir = tempdir().unwrap();
        let dest = dir.path().join("f.bin");
        let dl = DownloaderBuilder::default()
            .urls(vec![
                Url::parse(&format!("{}/f.bin", server_a.url())).unwrap(),
                Url::parse(&format!("{}/f.bin", server_b.url())).unwrap(),
            ])
            .max_connections(2)
            .dest_path(Some(dest.clone()))
            .config(test_config(4))
            .build()
            .unwrap();

        dl.run().await.unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), body);
        on_a.assert_async().await;
        on_b.assert_async().await;
    }

    #[tokio::test]
    async fn failing_range_request_fails_the_run() {
        let body: Vec<u8> = (0u8..16).collect();
        let mut server = Server::new_async().await;
        mount_probe(&mut server, &body).await;
        server
            .mock("GET", "/f.bin")
            .match_header("range", Matcher::Exact("bytes=0-15".to_string()))
            .with_status(500)
            .create_async()
            .await;

        let dir = tempdir().unwrap();
        let dest = dir.path().join("f.bin");
        let dl = DownloaderBuilder::default()
            .urls(vec![Url::parse(&format!("{}/f.bin", server.url())).unwrap()])
            .max_connections(1)
            .dest_path(Some(dest.clone()))
            .config(test_config(4))
            .build()
            .unwrap();

        let err = dl.run().await.unwrap_err();
        assert!(matches!(
            err,
            DlmError::Network(NetworkError::Status { status_code: 500 })
        ));
    }

    #[tokio::test]
    async fn zero_content_length_is_fatal() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/f.bin")
            .match_header("range", Matcher::Missing)
            .with_status(200)
            .with_body(Vec::new())
            .create_async()
            .await;

        let dir = tempdir().unwrap();
        let dl = DownloaderBuilder::default()
            .urls(vec![Url::parse(&format!("{}/f.bin", server.url())).unwrap()])
            .dest_path(Some(dir.path().join("f.bin")))
            .config(test_config(4))
            .build()
            .unwrap();

        assert!(matches!(
            dl.run().await,
            Err(DlmError::UnknownContentLength)
        ));
    }
}
