//! On-demand download coordination.
//!
//! One in-flight download per `(provider, external_id)` fingerprint.
//! Concurrent requests join the existing record and observe the same
//! terminal outcome through a watch channel; the record is created on miss
//! and removed on terminal, never mutated outside that lifecycle. The table
//! lock is only ever held to create, join, or remove a record, never across
//! I/O.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Bytes;
use futures_util::Stream;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, watch, Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Config, DownloadMode};
use crate::errors::{CadenzaError, Result};
use crate::models::Song;
use crate::services::cipher::StripeCipher;
use crate::services::http_pool::HttpPool;
use crate::services::library::LibraryIndex;
use crate::services::paths;
use crate::services::providers::{MusicProvider, StreamCipher};
use crate::services::tagger::MetadataTagger;

const MAX_ACTIVE_DOWNLOADS: usize = 8;
/// Capacity of the chunk channel feeding a progressive stream; bounds the
/// bytes buffered between download and client.
const STREAM_CHANNEL_CAPACITY: usize = 32;

pub type Fingerprint = (String, String);

#[derive(Debug, Clone)]
pub enum DownloadState {
    Queued,
    InProgress,
    Completed(PathBuf),
    Failed(Arc<CadenzaError>),
}

struct DownloadEntry {
    state_tx: watch::Sender<DownloadState>,
    cancel: CancellationToken,
    waiters: AtomicUsize,
    subscribers: std::sync::Mutex<Vec<mpsc::Sender<std::io::Result<Bytes>>>>,
}

/// Keeps the waiter count honest. When the last waiter goes away before the
/// record reaches a terminal state, the download itself is cancelled.
struct WaiterGuard {
    entry: Arc<DownloadEntry>,
}

impl WaiterGuard {
    fn new(entry: Arc<DownloadEntry>) -> Self {
        Self { entry }
    }
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        if self.entry.waiters.fetch_sub(1, Ordering::AcqRel) == 1 {
            let running = matches!(
                *self.entry.state_tx.borrow(),
                DownloadState::Queued | DownloadState::InProgress
            );
            if running {
                self.entry.cancel.cancel();
            }
        }
    }
}

/// Body of a first-play stream: chunks arrive as the download progresses.
pub struct ProgressiveStream {
    rx: mpsc::Receiver<std::io::Result<Bytes>>,
    _guard: WaiterGuard,
}

impl Stream for ProgressiveStream {
    type Item = std::io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// What a stream request gets back: either a finished file or a live feed.
pub enum FetchOutcome {
    Ready(PathBuf),
    Streaming(ProgressiveStream),
}

pub struct DownloadCoordinator {
    provider: Arc<dyn MusicProvider>,
    library: Arc<LibraryIndex>,
    tagger: Arc<MetadataTagger>,
    config: Arc<Config>,
    pool: HttpPool,
    table: Mutex<HashMap<Fingerprint, Arc<DownloadEntry>>>,
    limiter: Arc<Semaphore>,
}

impl DownloadCoordinator {
    pub fn new(
        provider: Arc<dyn MusicProvider>,
        library: Arc<LibraryIndex>,
        tagger: Arc<MetadataTagger>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            provider,
            library,
            tagger,
            config,
            pool: HttpPool::new(Vec::new()),
            table: Mutex::new(HashMap::new()),
            limiter: Arc::new(Semaphore::new(MAX_ACTIVE_DOWNLOADS)),
        }
    }

    /// Number of records currently in flight.
    pub async fn active_downloads(&self) -> usize {
        self.table.lock().await.len()
    }

    /// Fetch a track into the library, joining an in-flight download for the
    /// same fingerprint when one exists.
    pub async fn fetch(self: &Arc<Self>, provider: &str, external_id: &str) -> Result<PathBuf> {
        self.fetch_inner(provider, external_id, true).await
    }

    async fn fetch_inner(
        self: &Arc<Self>,
        provider: &str,
        external_id: &str,
        allow_fanout: bool,
    ) -> Result<PathBuf> {
        if let Some(path) = self.library.lookup(provider, external_id).await? {
            let _ = self.library.touch(provider, external_id).await;
            return Ok(path);
        }

        let (entry, owner) = self.join_or_create(provider, external_id).await;
        let guard = WaiterGuard::new(entry.clone());
        if owner {
            self.spawn_worker(entry.clone(), provider, external_id, allow_fanout, None);
        }
        let result = wait_terminal(&entry).await;
        drop(guard);
        result
    }

    /// Stream a track, creating the download on miss. The first requester of
    /// a new download gets a live feed from byte zero; joiners of an already
    /// running download wait for the file and serve that.
    pub async fn fetch_stream(
        self: &Arc<Self>,
        provider: &str,
        external_id: &str,
    ) -> Result<FetchOutcome> {
        if let Some(path) = self.library.lookup(provider, external_id).await? {
            let _ = self.library.touch(provider, external_id).await;
            return Ok(FetchOutcome::Ready(path));
        }

        let (entry, owner) = self.join_or_create(provider, external_id).await;
        let guard = WaiterGuard::new(entry.clone());

        if owner {
            let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
            entry.subscribers.lock().expect("subscriber lock").push(tx);
            self.spawn_worker(entry.clone(), provider, external_id, true, None);
            return Ok(FetchOutcome::Streaming(ProgressiveStream {
                rx,
                _guard: guard,
            }));
        }

        let path = wait_terminal(&entry).await;
        drop(guard);
        Ok(FetchOutcome::Ready(path?))
    }

    async fn join_or_create(&self, provider: &str, external_id: &str) -> (Arc<DownloadEntry>, bool) {
        let fingerprint = (provider.to_string(), external_id.to_string());
        let mut table = self.table.lock().await;
        if let Some(entry) = table.get(&fingerprint) {
            entry.waiters.fetch_add(1, Ordering::AcqRel);
            return (entry.clone(), false);
        }

        let (state_tx, _) = watch::channel(DownloadState::Queued);
        let entry = Arc::new(DownloadEntry {
            state_tx,
            cancel: CancellationToken::new(),
            waiters: AtomicUsize::new(1),
            subscribers: std::sync::Mutex::new(Vec::new()),
        });
        table.insert(fingerprint, entry.clone());
        (entry, true)
    }

    fn spawn_worker(
        self: &Arc<Self>,
        entry: Arc<DownloadEntry>,
        provider: &str,
        external_id: &str,
        allow_fanout: bool,
        song_hint: Option<Song>,
    ) {
        let coordinator = self.clone();
        let provider = provider.to_string();
        let external_id = external_id.to_string();
        tokio::spawn(async move {
            coordinator
                .run_worker(entry, provider, external_id, allow_fanout, song_hint)
                .await;
        });
    }

    async fn run_worker(
        self: Arc<Self>,
        entry: Arc<DownloadEntry>,
        provider: String,
        external_id: String,
        allow_fanout: bool,
        song_hint: Option<Song>,
    ) {
        let fingerprint = (provider.clone(), external_id.clone());

        let permit = match self.limiter.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };
        entry.state_tx.send_replace(DownloadState::InProgress);

        let result = self
            .download_once(&entry, &provider, &external_id, song_hint)
            .await;

        // Remove the record before broadcasting the terminal state: anyone
        // who observes the outcome and immediately re-requests must get a
        // fresh record, never this finished one.
        self.table.lock().await.remove(&fingerprint);

        match &result {
            Ok((path, song)) => {
                info!("downloaded {}:{} -> {}", provider, external_id, path.display());
                entry
                    .state_tx
                    .send_replace(DownloadState::Completed(path.clone()));
                if allow_fanout && self.config.download_mode == DownloadMode::Album {
                    self.spawn_album_fanout(song.clone());
                }
            }
            Err(e) if e.is_cancelled() => {
                debug!("download {}:{} cancelled", provider, external_id);
                entry
                    .state_tx
                    .send_replace(DownloadState::Failed(Arc::new(CadenzaError::Cancelled)));
            }
            Err(e) => {
                warn!("download {}:{} failed: {}", provider, external_id, e);
                entry
                    .state_tx
                    .send_replace(DownloadState::Failed(Arc::new(replicate_error(e))));
            }
        }

        // Dropping the subscribers ends any live stream; a failure gets one
        // final error frame first.
        let subscribers: Vec<_> = entry
            .subscribers
            .lock()
            .expect("subscriber lock")
            .drain(..)
            .collect();
        if let Err(e) = &result {
            for tx in subscribers {
                let _ = tx.try_send(Err(std::io::Error::other(e.to_string())));
            }
        }
        drop(permit);
    }

    /// The download sequence proper: resolve, stream, decrypt, tag, place,
    /// register. Any error after a partial write removes the partial file.
    async fn download_once(
        &self,
        entry: &Arc<DownloadEntry>,
        provider: &str,
        external_id: &str,
        song_hint: Option<Song>,
    ) -> Result<(PathBuf, Song)> {
        // Another request may have finished this fingerprint between our
        // admission check and here.
        if let Some(path) = self.library.lookup(provider, external_id).await? {
            let song = song_hint.unwrap_or_else(|| Song::external(provider, external_id));
            return Ok((path, song));
        }

        let song = match song_hint {
            Some(song) => song,
            None => self.provider.get_song(external_id).await?,
        };

        let source = match self
            .provider
            .resolve_download(external_id, self.config.preferred_quality)
            .await
        {
            Err(CadenzaError::Unauthenticated(msg)) => {
                warn!("download resolution was rejected ({}), retrying once", msg);
                self.provider
                    .resolve_download(external_id, self.config.preferred_quality)
                    .await?
            }
            other => other?,
        };

        let extension = paths::extension_for_mime(&source.mime_type);
        let target = paths::track_path(
            self.library.root(),
            &song.artist,
            &song.album,
            &song.title,
            song.track_number,
            extension,
        );
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        let target = paths::resolve_collision(&target);
        let partial = paths::partial_path(&target);

        let copy_result = self
            .copy_stream(entry, &source.url, &source.cipher, &partial)
            .await;
        if let Err(e) = copy_result {
            let _ = fs::remove_file(&partial).await;
            return Err(e);
        }

        // Tag the finished bytes while they still sit at the partial path;
        // a tagging failure downgrades to a warning, never a lost download.
        if let Err(e) = self.tagger.tag_file(&partial, &song).await {
            warn!("tagging {} failed: {}", target.display(), e);
        }

        fs::rename(&partial, &target).await?;
        self.library.register(&song, &target).await?;

        Ok((target, song))
    }

    async fn copy_stream(
        &self,
        entry: &Arc<DownloadEntry>,
        url: &str,
        cipher: &StreamCipher,
        partial: &Path,
    ) -> Result<()> {
        let response = self.pool.get(url).await?;
        if !response.status().is_success() {
            return Err(CadenzaError::Transient(format!(
                "media host returned {}",
                response.status()
            )));
        }

        let mut decryptor = match cipher {
            StreamCipher::None => None,
            StreamCipher::BlowfishCbcStripe { key } => Some(StripeCipher::decryptor(*key)),
        };

        let file = fs::File::create(partial).await?;
        let mut writer = tokio::io::BufWriter::with_capacity(64 * 1024, file);
        let mut response = response;

        loop {
            let chunk = tokio::select! {
                _ = entry.cancel.cancelled() => return Err(CadenzaError::Cancelled),
                chunk = response.chunk() => chunk?,
            };
            let Some(chunk) = chunk else { break };

            let plain: Bytes = match decryptor.as_mut() {
                Some(cipher) => Bytes::from(cipher.process(&chunk)?),
                None => chunk,
            };
            if plain.is_empty() {
                continue;
            }
            writer.write_all(&plain).await?;
            self.broadcast(entry, plain).await?;
        }

        if let Some(mut cipher) = decryptor.take() {
            let tail = Bytes::from(cipher.finish());
            if !tail.is_empty() {
                writer.write_all(&tail).await?;
                self.broadcast(entry, tail).await?;
            }
        }

        writer.flush().await?;
        Ok(())
    }

    /// Forward a chunk to every live stream subscriber, pacing on the
    /// slowest one. A subscriber that went away is dropped silently.
    async fn broadcast(&self, entry: &Arc<DownloadEntry>, chunk: Bytes) -> Result<()> {
        let subscribers: Vec<_> = entry
            .subscribers
            .lock()
            .expect("subscriber lock")
            .clone();
        if subscribers.is_empty() {
            return Ok(());
        }

        let mut gone = Vec::new();
        for (i, tx) in subscribers.iter().enumerate() {
            let send = tokio::select! {
                _ = entry.cancel.cancelled() => return Err(CadenzaError::Cancelled),
                sent = tx.send(Ok(chunk.clone())) => sent,
            };
            if send.is_err() {
                gone.push(i);
            }
        }

        if !gone.is_empty() {
            let mut live = entry.subscribers.lock().expect("subscriber lock");
            live.retain(|tx| !tx.is_closed());
        }
        Ok(())
    }

    fn spawn_album_fanout(self: &Arc<Self>, song: Song) {
        let Some(album_id) = song.album_id.clone() else {
            return;
        };
        let crate::services::ids::DecodedId::External {
            provider,
            external_id: album_external,
            ..
        } = crate::services::ids::decode(&album_id)
        else {
            return;
        };

        let coordinator = self.clone();
        tokio::spawn(async move {
            info!("album mode: fetching the rest of album {}", album_external);
            let album = match coordinator.provider.get_album(&album_external).await {
                Ok(album) => album,
                Err(e) => {
                    warn!("album fanout lookup failed: {}", e);
                    return;
                }
            };
            for track in album.songs {
                let Some(track_external) = track.external_id.clone() else {
                    continue;
                };
                if let Err(e) = coordinator
                    .fetch_inner(&provider, &track_external, false)
                    .await
                {
                    if !e.is_cancelled() {
                        warn!("album fanout for track {} failed: {}", track_external, e);
                    }
                }
            }
        });
    }
}

async fn wait_terminal(entry: &Arc<DownloadEntry>) -> Result<PathBuf> {
    let mut rx = entry.state_tx.subscribe();
    loop {
        let state = rx.borrow_and_update().clone();
        match state {
            DownloadState::Completed(path) => return Ok(path),
            DownloadState::Failed(err) => return Err(replicate_error(&err)),
            DownloadState::Queued | DownloadState::InProgress => {}
        }
        if rx.changed().await.is_err() {
            return Err(CadenzaError::Internal(
                "download record vanished mid-flight".to_string(),
            ));
        }
    }
}

/// Errors are broadcast to several waiters; produce an equivalent owned copy
/// per waiter.
pub(crate) fn replicate_error(e: &CadenzaError) -> CadenzaError {
    match e {
        CadenzaError::NotConfigured(m) => CadenzaError::NotConfigured(m.clone()),
        CadenzaError::NotFound(m) => CadenzaError::NotFound(m.clone()),
        CadenzaError::Unauthenticated(m) => CadenzaError::Unauthenticated(m.clone()),
        CadenzaError::Unauthorized(s) => CadenzaError::Unauthorized(*s),
        CadenzaError::RateLimited => CadenzaError::RateLimited,
        CadenzaError::Transient(m) => CadenzaError::Transient(m.clone()),
        CadenzaError::Decryption(m) => CadenzaError::Decryption(m.clone()),
        CadenzaError::Integrity(m) => CadenzaError::Integrity(m.clone()),
        CadenzaError::Cancelled => CadenzaError::Cancelled,
        CadenzaError::Io(io) => CadenzaError::Transient(io.to_string()),
        CadenzaError::Http(http) => CadenzaError::Transient(http.to_string()),
        CadenzaError::Internal(m) => CadenzaError::Internal(m.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use async_trait::async_trait;
    use futures_util::StreamExt;

    use crate::config::{BackendKind, Config, ExplicitFilter, ProviderKind, StorageMode};
    use crate::models::{Album, Artist, Quality};
    use crate::services::providers::DownloadSource;

    struct FakeProvider {
        url: String,
        cipher: StreamCipher,
        fail_resolution: bool,
        resolve_calls: AtomicUsize,
    }

    impl FakeProvider {
        fn new(url: String) -> Self {
            Self {
                url,
                cipher: StreamCipher::None,
                fail_resolution: false,
                resolve_calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl MusicProvider for FakeProvider {
        fn name(&self) -> &'static str {
            "fake"
        }

        async fn search_songs(&self, _query: &str, _limit: u32) -> Result<Vec<Song>> {
            Ok(Vec::new())
        }

        async fn get_song(&self, external_id: &str) -> Result<Song> {
            let mut song = Song::external("fake", external_id);
            song.title = format!("Track {}", external_id);
            song.artist = "Fake Artist".to_string();
            song.album_artist = "Fake Artist".to_string();
            song.album = "Fake Album".to_string();
            song.track_number = Some(1);
            Ok(song)
        }

        async fn get_album(&self, external_id: &str) -> Result<Album> {
            Err(CadenzaError::NotFound(format!("album {}", external_id)))
        }

        async fn get_artist(&self, external_id: &str) -> Result<Artist> {
            Err(CadenzaError::NotFound(format!("artist {}", external_id)))
        }

        async fn get_artist_albums(&self, _external_id: &str) -> Result<Vec<Album>> {
            Ok(Vec::new())
        }

        async fn resolve_download(
            &self,
            _external_id: &str,
            quality: Quality,
        ) -> Result<DownloadSource> {
            self.resolve_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_resolution {
                return Err(CadenzaError::Integrity("manifest has no urls".to_string()));
            }
            Ok(DownloadSource {
                url: self.url.clone(),
                mime_type: "audio/mpeg".to_string(),
                quality,
                cipher: self.cipher.clone(),
            })
        }

        async fn is_available(&self) -> bool {
            true
        }
    }

    fn test_config(root: &Path) -> Arc<Config> {
        Arc::new(Config {
            server_host: "127.0.0.1".to_string(),
            server_port: 0,
            library_root: root.to_path_buf(),
            playlists_dir: root.join("playlists"),
            storage_mode: StorageMode::Permanent,
            cache_ttl_hours: 720,
            provider: ProviderKind::Tidal,
            preferred_quality: Quality::High,
            explicit_filter: ExplicitFilter::All,
            download_mode: DownloadMode::Track,
            external_playlists_enabled: true,
            backend_url: None,
            backend_kind: BackendKind::Jellyfin,
            deezer_arl: None,
            deezer_arl_fallback: None,
            qobuz_app_id: None,
            qobuz_secret: None,
            qobuz_bundle_url: None,
        })
    }

    /// Minimal CDN: serves `body` in 1 KiB chunks, optionally pausing
    /// between chunks so tests can observe mid-flight state.
    async fn spawn_cdn(body: Vec<u8>, chunk_delay: Option<Duration>) -> String {
        use axum::routing::get;
        use axum::Router;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().route(
            "/track",
            get(move || {
                let body = body.clone();
                async move {
                    let chunks: Vec<Bytes> =
                        body.chunks(1024).map(Bytes::copy_from_slice).collect();
                    let stream = futures_util::stream::iter(chunks).then(move |chunk| async move {
                        if let Some(delay) = chunk_delay {
                            tokio::time::sleep(delay).await;
                        }
                        Ok::<Bytes, std::convert::Infallible>(chunk)
                    });
                    axum::body::Body::from_stream(stream)
                }
            }),
        );
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/track", addr)
    }

    fn coordinator_with(
        provider: FakeProvider,
        root: &Path,
    ) -> (Arc<DownloadCoordinator>, Arc<LibraryIndex>) {
        let library = Arc::new(LibraryIndex::new(root.to_path_buf()));
        let coordinator = Arc::new(DownloadCoordinator::new(
            Arc::new(provider),
            library.clone(),
            Arc::new(MetadataTagger::new()),
            test_config(root),
        ));
        (coordinator, library)
    }

    #[tokio::test]
    async fn concurrent_fetches_share_one_download() {
        let dir = tempfile::tempdir().unwrap();
        let body: Vec<u8> = (0..8192u32).map(|i| (i % 251) as u8).collect();
        let url = spawn_cdn(body.clone(), Some(Duration::from_millis(5))).await;

        let provider = Arc::new(FakeProvider::new(url));
        let library = Arc::new(LibraryIndex::new(dir.path().to_path_buf()));
        let coordinator = Arc::new(DownloadCoordinator::new(
            provider.clone(),
            library.clone(),
            Arc::new(MetadataTagger::new()),
            test_config(dir.path()),
        ));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let c = coordinator.clone();
            handles.push(tokio::spawn(async move { c.fetch("fake", "1001").await }));
        }
        let mut paths = Vec::new();
        for handle in handles {
            paths.push(handle.await.unwrap().unwrap());
        }

        assert_eq!(provider.resolve_calls.load(Ordering::SeqCst), 1);
        assert!(paths.windows(2).all(|w| w[0] == w[1]));

        let path = &paths[0];
        assert!(path.exists());
        assert_eq!(std::fs::read(path).unwrap(), body);
        assert_eq!(
            library.lookup("fake", "1001").await.unwrap().as_deref(),
            Some(path.as_path())
        );
        assert_eq!(coordinator.active_downloads().await, 0);
    }

    #[tokio::test]
    async fn second_fetch_is_served_from_the_library() {
        let dir = tempfile::tempdir().unwrap();
        let url = spawn_cdn(vec![7u8; 4096], None).await;
        let provider = Arc::new(FakeProvider::new(url));
        let coordinator = Arc::new(DownloadCoordinator::new(
            provider.clone(),
            Arc::new(LibraryIndex::new(dir.path().to_path_buf())),
            Arc::new(MetadataTagger::new()),
            test_config(dir.path()),
        ));

        let first = coordinator.fetch("fake", "7").await.unwrap();
        let second = coordinator.fetch("fake", "7").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(provider.resolve_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn deleted_file_triggers_a_fresh_download() {
        let dir = tempfile::tempdir().unwrap();
        let url = spawn_cdn(vec![3u8; 2048], None).await;
        let provider = Arc::new(FakeProvider::new(url));
        let coordinator = Arc::new(DownloadCoordinator::new(
            provider.clone(),
            Arc::new(LibraryIndex::new(dir.path().to_path_buf())),
            Arc::new(MetadataTagger::new()),
            test_config(dir.path()),
        ));

        let first = coordinator.fetch("fake", "3").await.unwrap();
        std::fs::remove_file(&first).unwrap();

        let second = coordinator.fetch("fake", "3").await.unwrap();
        assert!(second.exists());
        assert_eq!(provider.resolve_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn final_path_appears_only_when_complete() {
        let dir = tempfile::tempdir().unwrap();
        let body = vec![9u8; 4096]; // four chunks
        let url = spawn_cdn(body.clone(), Some(Duration::from_millis(150))).await;
        let (coordinator, _) = coordinator_with(FakeProvider::new(url), dir.path());

        let c = coordinator.clone();
        let handle = tokio::spawn(async move { c.fetch("fake", "55").await });

        // Mid-flight: only the .part sibling may exist.
        tokio::time::sleep(Duration::from_millis(300)).await;
        let target = dir
            .path()
            .join("Fake Artist")
            .join("Fake Album")
            .join("01 - Track 55.mp3");
        assert!(!target.exists(), "final path must not appear mid-flight");
        assert!(paths::partial_path(&target).exists(), "partial file should exist");

        let finished = handle.await.unwrap().unwrap();
        assert_eq!(finished, target);
        assert!(target.exists());
        assert!(!paths::partial_path(&target).exists());
        assert_eq!(std::fs::read(&target).unwrap(), body);
    }

    #[tokio::test]
    async fn striped_stream_is_decrypted_on_the_way_down() {
        let dir = tempfile::tempdir().unwrap();
        let plain: Vec<u8> = (0..2048 * 4 + 100).map(|i| (i % 241) as u8).collect();

        let key = crate::services::cipher::derive_track_key("42", b"0123456789abcdef");
        let mut enc = StripeCipher::encryptor(key);
        let mut striped = enc.process(&plain).unwrap();
        striped.extend(enc.finish());

        let url = spawn_cdn(striped, None).await;
        let mut provider = FakeProvider::new(url);
        provider.cipher = StreamCipher::BlowfishCbcStripe { key };
        let (coordinator, _) = coordinator_with(provider, dir.path());

        let path = coordinator.fetch("fake", "42").await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), plain);
    }

    #[tokio::test]
    async fn failed_resolution_leaves_no_trace() {
        let dir = tempfile::tempdir().unwrap();
        let mut provider = FakeProvider::new("http://unused.invalid/".to_string());
        provider.fail_resolution = true;
        let (coordinator, library) = coordinator_with(provider, dir.path());

        let err = coordinator.fetch("fake", "404").await.unwrap_err();
        assert!(matches!(err, CadenzaError::Integrity(_)), "got {:?}", err);

        assert_eq!(library.lookup("fake", "404").await.unwrap(), None);
        assert!(!dir.path().join("Fake Artist").exists());
        assert_eq!(coordinator.active_downloads().await, 0);
    }

    #[tokio::test]
    async fn dropping_the_only_streamer_cancels_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let body = vec![1u8; 1024 * 12];
        let url = spawn_cdn(body, Some(Duration::from_millis(100))).await;
        let (coordinator, library) = coordinator_with(FakeProvider::new(url), dir.path());

        let outcome = coordinator.fetch_stream("fake", "77").await.unwrap();
        let mut stream = match outcome {
            FetchOutcome::Streaming(stream) => stream,
            FetchOutcome::Ready(_) => panic!("expected a live stream"),
        };

        // Take one chunk, then hang up.
        let first = stream.next().await.expect("one chunk").unwrap();
        assert!(!first.is_empty());
        drop(stream);

        // Give the worker time to observe the cancellation.
        tokio::time::sleep(Duration::from_millis(600)).await;

        let target = dir
            .path()
            .join("Fake Artist")
            .join("Fake Album")
            .join("01 - Track 77.mp3");
        assert!(!target.exists());
        assert!(!paths::partial_path(&target).exists());
        assert_eq!(library.lookup("fake", "77").await.unwrap(), None);
        assert_eq!(coordinator.active_downloads().await, 0);
    }

    #[tokio::test]
    async fn live_stream_carries_the_full_body() {
        let dir = tempfile::tempdir().unwrap();
        let body: Vec<u8> = (0..5000u32).map(|i| (i % 13) as u8).collect();
        let url = spawn_cdn(body.clone(), None).await;
        let (coordinator, library) = coordinator_with(FakeProvider::new(url), dir.path());

        let outcome = coordinator.fetch_stream("fake", "88").await.unwrap();
        let mut stream = match outcome {
            FetchOutcome::Streaming(stream) => stream,
            FetchOutcome::Ready(_) => panic!("expected a live stream"),
        };

        let mut received = Vec::new();
        while let Some(chunk) = stream.next().await {
            received.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(received, body);

        // And the file landed in the library for the next play.
        let path = library.lookup("fake", "88").await.unwrap().expect("mapping");
        assert_eq!(std::fs::read(path).unwrap(), body);
    }
}
