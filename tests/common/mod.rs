#![allow(dead_code)]

use async_trait::async_trait;
use mockall::mock;
use scriptdb::fetch::{FetchError, FetchOptions, FetchResponse, RemoteFetcher};
use scriptdb::{
    Config, InstallOutcome, KeyValueBackend, MemoryBackend, Notification, Notifier, ScriptSource,
    ScriptStore, SyncTrigger, UrlMatcher,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};

mock! {
    pub NotifierService {}

    #[async_trait]
    impl Notifier for NotifierService {
        async fn notify(&self, notification: Notification);
    }
}

mock! {
    pub SyncService {}

    #[async_trait]
    impl SyncTrigger for SyncService {
        async fn notify_sync(&self);
    }
}

enum Reply {
    Body(Vec<u8>, Option<String>),
    Status(u16),
}

/// Fetcher serving canned responses; unknown URLs get a 404
#[derive(Default)]
pub struct StubFetcher {
    replies: Mutex<HashMap<String, Reply>>,
    requests: Mutex<Vec<String>>,
    delay: Mutex<Option<Duration>>,
    gates: Mutex<HashMap<String, Arc<Notify>>>,
}

impl StubFetcher {
    pub fn serve(&self, url: &str, body: &str) {
        self.replies
            .lock()
            .unwrap()
            .insert(url.to_string(), Reply::Body(body.as_bytes().to_vec(), None));
    }

    pub fn serve_typed(&self, url: &str, body: &[u8], content_type: &str) {
        self.replies.lock().unwrap().insert(
            url.to_string(),
            Reply::Body(body.to_vec(), Some(content_type.to_string())),
        );
    }

    pub fn fail(&self, url: &str, status: u16) {
        self.replies
            .lock()
            .unwrap()
            .insert(url.to_string(), Reply::Status(status));
    }

    pub fn slow_down(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    /// Hold fetches of `url` until the returned gate is notified
    pub fn gate(&self, url: &str) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.gates
            .lock()
            .unwrap()
            .insert(url.to_string(), gate.clone());
        gate
    }

    pub fn requests(&self, url: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|u| *u == url)
            .count()
    }

    pub fn total_requests(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl RemoteFetcher for StubFetcher {
    async fn fetch(&self, url: &str, _options: &FetchOptions) -> Result<FetchResponse, FetchError> {
        self.requests.lock().unwrap().push(url.to_string());
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let gate = self.gates.lock().unwrap().get(url).cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let replies = self.replies.lock().unwrap();
        match replies.get(url) {
            Some(Reply::Body(body, content_type)) => {
                let mut response = FetchResponse::ok(body.clone());
                response.content_type = content_type.clone();
                Ok(response)
            }
            Some(Reply::Status(status)) => Err(FetchError::status(url, *status)),
            None => Err(FetchError::status(url, 404)),
        }
    }
}

/// Store over an in-memory backend with observable collaborators
pub struct TestContext {
    pub backend: Arc<MemoryBackend>,
    pub fetcher: Arc<StubFetcher>,
    pub store: ScriptStore,
    pub notifications: mpsc::UnboundedReceiver<Notification>,
    pub syncs: mpsc::UnboundedReceiver<()>,
    config: Config,
}

impl TestContext {
    pub async fn new() -> Self {
        Self::build(Arc::new(MemoryBackend::new()), Config::default(), None).await
    }

    pub async fn with_backend(backend: Arc<MemoryBackend>) -> Self {
        Self::build(backend, Config::default(), None).await
    }

    pub async fn with_config(config: Config) -> Self {
        Self::build(Arc::new(MemoryBackend::new()), config, None).await
    }

    pub async fn with_matcher(matcher: Arc<dyn UrlMatcher>) -> Self {
        Self::build(Arc::new(MemoryBackend::new()), Config::default(), Some(matcher)).await
    }

    async fn build(
        backend: Arc<MemoryBackend>,
        config: Config,
        matcher: Option<Arc<dyn UrlMatcher>>,
    ) -> Self {
        let fetcher = Arc::new(StubFetcher::default());
        let (notify_tx, notifications) = mpsc::unbounded_channel();
        let (sync_tx, syncs) = mpsc::unbounded_channel();

        let mut notifier = MockNotifierService::new();
        notifier.expect_notify().returning(move |notification| {
            let _ = notify_tx.send(notification);
        });
        let mut sync = MockSyncService::new();
        sync.expect_notify_sync().returning(move || {
            let _ = sync_tx.send(());
        });

        let mut builder = ScriptStore::builder(backend.clone(), fetcher.clone())
            .notifier(Arc::new(notifier))
            .sync(Arc::new(sync))
            .config(config.clone());
        if let Some(matcher) = matcher {
            builder = builder.matcher(matcher);
        }
        let store = builder.open().await.expect("store should open");

        Self {
            backend,
            fetcher,
            store,
            notifications,
            syncs,
            config,
        }
    }

    /// A second store loaded from the same backend
    pub async fn reopen(&self) -> ScriptStore {
        ScriptStore::builder(self.backend.clone(), self.fetcher.clone())
            .config(self.config.clone())
            .open()
            .await
            .expect("store should reopen")
    }

    pub async fn install(&self, code: &str) -> InstallOutcome {
        self.store
            .install(ScriptSource::new(code))
            .await
            .expect("install should succeed")
    }

    pub async fn install_from(&self, code: &str, url: &str) -> InstallOutcome {
        self.store
            .install(ScriptSource {
                code: code.to_string(),
                url: Some(url.to_string()),
                ..Default::default()
            })
            .await
            .expect("install should succeed")
    }

    pub async fn remove_key(&self, key: &str) {
        self.backend
            .remove_multi(&[key.to_string()])
            .await
            .expect("remove should succeed");
    }

    /// Next notification raised within a second
    pub async fn next_notification(&mut self) -> Option<Notification> {
        tokio::time::timeout(Duration::from_secs(1), self.notifications.recv())
            .await
            .ok()
            .flatten()
    }

    /// True when no notification arrives within a short window
    pub async fn no_notification(&mut self) -> bool {
        tokio::time::timeout(Duration::from_millis(50), self.notifications.recv())
            .await
            .is_err()
    }

    /// Wait until `key` is stored, giving up after a second
    pub async fn wait_for_key(&self, key: &str) -> bool {
        for _ in 0..200 {
            if self.backend.contains(key).await {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }

    pub async fn next_sync(&mut self) -> bool {
        tokio::time::timeout(Duration::from_secs(1), self.syncs.recv())
            .await
            .is_ok_and(|v| v.is_some())
    }
}

/// Userscript source with the given name, namespace and extra metadata lines
/// (without the `// @` prefix)
pub fn userscript(name: &str, namespace: &str, extra: &[&str]) -> String {
    let mut code = String::from("// ==UserScript==\n");
    code.push_str(&format!("// @name {}\n", name));
    if !namespace.is_empty() {
        code.push_str(&format!("// @namespace {}\n", namespace));
    }
    for line in extra {
        code.push_str(&format!("// @{}\n", line));
    }
    code.push_str("// ==/UserScript==\n");
    code.push_str(&format!("console.log({:?});\n", name));
    code
}
