//! Redis-backed correlation broker
//!
//! Jobs go out with `LPUSH <queue>` on a shared, auto-reconnecting connection.
//! Results come back through a single dispatcher task that owns its own
//! connection and `BRPOP`s across every pending response key, so one caller's
//! blocking wait never sits in front of another caller's push.
//!
//! ```text
//!   handler ──register──▶ WaitRegistry ◀──resolve── dispatcher ──BRPOP k1 k2 ..──▶ Redis
//!   handler ──LPUSH──────────────────────────────────────────────────────────────▶ Redis
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::{AsyncCommands, Client, RedisResult};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::broker::{await_registered, response_key, BrokerError, BrokerStatus, Delivery, JobBroker};
use super::jobs::{self, Job, JobResult};
use super::registry::WaitRegistry;
use super::workers::JobSource;
use crate::config::RedisConfig;
use crate::utils::{with_retry, Backoff};

pub struct RedisBroker {
    queue_name: String,
    conn: ConnectionManager,
    registry: WaitRegistry,
    status: Arc<watch::Sender<BrokerStatus>>,
    tasks: Vec<JoinHandle<()>>,
}

impl RedisBroker {
    /// Connect and start the dispatcher, cleanup and health-check tasks.
    ///
    /// Fails if Redis is unreachable at startup.
    pub async fn connect(config: &RedisConfig) -> Result<Self, BrokerError> {
        let client = Client::open(config.url())?;
        let conn = ConnectionManager::new(client.clone()).await?;
        let blocking = client.get_multiplexed_async_connection().await?;

        let endpoint = config.endpoint();
        let (status, _) = watch::channel(BrokerStatus::connected(format!("connected to {}", endpoint)));
        let status = Arc::new(status);

        let (release_tx, release_rx) = mpsc::unbounded_channel();
        let registry = WaitRegistry::with_release_hook(release_tx);
        let delivering = Arc::new(AtomicBool::new(true));

        let dispatcher = Dispatcher {
            client,
            registry: registry.clone(),
            status: status.clone(),
            delivering: delivering.clone(),
            poll_interval: config.poll_interval(),
            endpoint,
        };

        let tasks = vec![
            tokio::spawn(dispatcher.run(blocking)),
            tokio::spawn(delete_released(conn.clone(), release_rx)),
            tokio::spawn(health_check(
                conn.clone(),
                status.clone(),
                delivering,
                config.health_check_interval(),
            )),
        ];

        info!(queue = %config.queue_name, "Redis broker ready");

        Ok(Self {
            queue_name: config.queue_name.clone(),
            conn,
            registry,
            status,
            tasks,
        })
    }

    fn mark_down(&self, err: &redis::RedisError) {
        if err.is_io_error() || err.is_connection_dropped() {
            self.status
                .send_replace(BrokerStatus::disconnected(err.to_string()));
        }
    }
}

impl Drop for RedisBroker {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[async_trait]
impl JobBroker for RedisBroker {
    async fn enqueue(&self, job: &Job) -> Result<(), BrokerError> {
        let key = response_key(&self.queue_name, job.id);
        let bytes = jobs::encode(job).map_err(BrokerError::Encode)?;

        // Dropped (push failed or caller went away) => slot removed and key deleted.
        let registration = self
            .registry
            .register(&key)
            .ok_or(BrokerError::DuplicateJob(job.id))?;

        let mut conn = self.conn.clone();
        let pushed: RedisResult<i64> = conn.lpush(&self.queue_name, bytes).await;

        match pushed {
            Ok(depth) => {
                registration.keep();
                debug!(job_id = %job.id, queue = %self.queue_name, depth, "Job pushed to queue");
                Ok(())
            }
            Err(err) => {
                self.mark_down(&err);
                Err(err.into())
            }
        }
    }

    async fn await_result(&self, job_id: Uuid, timeout: Duration) -> Result<Delivery, BrokerError> {
        await_registered(&self.registry, &self.queue_name, job_id, timeout).await
    }

    fn status(&self) -> BrokerStatus {
        self.status.borrow().clone()
    }

    fn queue_name(&self) -> &str {
        &self.queue_name
    }
}

struct Dispatcher {
    client: Client,
    registry: WaitRegistry,
    status: Arc<watch::Sender<BrokerStatus>>,
    /// False while the dispatcher has no working connection
    delivering: Arc<AtomicBool>,
    poll_interval: Duration,
    endpoint: String,
}

impl Dispatcher {
    async fn run(self, mut conn: MultiplexedConnection) {
        let timeout = self.poll_interval.as_secs_f64();

        loop {
            let keys = self.registry.pending_keys();
            if keys.is_empty() {
                self.registry.registered().await;
                continue;
            }

            let popped: RedisResult<Option<(String, Vec<u8>)>> = conn.brpop(&keys, timeout).await;
            match popped {
                Ok(Some((key, bytes))) => {
                    if !self.registry.resolve(&key, bytes) {
                        debug!(response_key = %key, "Dropped result nobody is waiting for");
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    let detail = err.to_string();
                    warn!(error = %detail, "Result dispatcher lost its connection");
                    self.delivering.store(false, Ordering::SeqCst);
                    self.status
                        .send_replace(BrokerStatus::disconnected(detail.clone()));
                    let failed = self.registry.fail_all(&detail);
                    if failed > 0 {
                        warn!(failed, "Failed pending waits after connection loss");
                    }
                    match self.reconnect().await {
                        Ok(fresh) => conn = fresh,
                        Err(err) => {
                            error!(error = %err, "Result dispatcher giving up");
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn reconnect(&self) -> RedisResult<MultiplexedConnection> {
        let backoff = Backoff::default();
        let client = self.client.clone();

        let conn = with_retry(&backoff, || {
            let client = client.clone();
            async move { client.get_multiplexed_async_connection().await }.boxed()
        })
        .await?;

        info!("Result dispatcher reconnected");
        self.delivering.store(true, Ordering::SeqCst);
        self.status
            .send_replace(BrokerStatus::connected(format!("connected to {}", self.endpoint)));
        Ok(conn)
    }
}

async fn delete_released(mut conn: ConnectionManager, mut released: mpsc::UnboundedReceiver<String>) {
    while let Some(key) = released.recv().await {
        let deleted: RedisResult<i64> = conn.del(&key).await;
        match deleted {
            Ok(_) => debug!(response_key = %key, "Released response key"),
            Err(err) => debug!(response_key = %key, error = %err, "Could not delete response key"),
        }
    }
}

// Flips status down on a failed PING. Coming back up also needs the
// dispatcher to be delivering again; otherwise the dispatcher reports it.
async fn health_check(
    mut conn: ConnectionManager,
    status: Arc<watch::Sender<BrokerStatus>>,
    delivering: Arc<AtomicBool>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let pong: RedisResult<String> = redis::cmd("PING").query_async(&mut conn).await;
        let next = match pong {
            Ok(_) => {
                if status.borrow().connected || !delivering.load(Ordering::SeqCst) {
                    continue;
                }
                BrokerStatus::connected("connection restored")
            }
            Err(err) => BrokerStatus::disconnected(err.to_string()),
        };
        status.send_replace(next);
    }
}

/// Worker-side view of the same queue: pop jobs, publish results
pub struct RedisJobSource {
    queue_name: String,
    blocking: MultiplexedConnection,
    publisher: ConnectionManager,
    poll_interval: Duration,
    result_ttl_secs: i64,
}

impl RedisJobSource {
    pub async fn connect(config: &RedisConfig) -> Result<Self, BrokerError> {
        let client = Client::open(config.url())?;
        let publisher = ConnectionManager::new(client.clone()).await?;
        let blocking = client.get_multiplexed_async_connection().await?;

        Ok(Self {
            queue_name: config.queue_name.clone(),
            blocking,
            publisher,
            poll_interval: config.poll_interval(),
            result_ttl_secs: config.result_ttl_secs as i64,
        })
    }
}

#[async_trait]
impl JobSource for RedisJobSource {
    async fn next_job(&self) -> Result<Option<Vec<u8>>, BrokerError> {
        let mut conn = self.blocking.clone();
        // The gateway LPUSHes, so popping from the right keeps FIFO order.
        let popped: Option<(String, Vec<u8>)> = conn
            .brpop(&self.queue_name, self.poll_interval.as_secs_f64())
            .await?;
        Ok(popped.map(|(_, bytes)| bytes))
    }

    async fn publish(&self, result: &JobResult) -> Result<(), BrokerError> {
        let key = response_key(&self.queue_name, result.job_id);
        let mut conn = self.publisher.clone();

        let bytes = jobs::encode_result(result).map_err(BrokerError::Encode)?;

        let _: () = redis::pipe()
            .atomic()
            .lpush(&key, bytes)
            .ignore()
            .expire(&key, self.result_ttl_secs)
            .ignore()
            .query_async(&mut conn)
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::jobs::{JobOptions, Outcome};
    use crate::types::AppError;
    use axum::http::StatusCode;
    use serde_json::json;
    use std::collections::{HashMap, VecDeque};
    use std::net::SocketAddr;
    use std::sync::Mutex;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::net::tcp::OwnedReadHalf;
    use tokio::net::{TcpListener, TcpStream};

    const QUEUE: &str = "adlm_queue";

    /// In-process RESP2 server speaking just enough Redis for the broker:
    /// LPUSH, BRPOP, DEL, EXPIRE, PING and MULTI/EXEC.
    struct RedisStub {
        addr: SocketAddr,
        store: Arc<Store>,
        kill: Arc<watch::Sender<u64>>,
        accept: JoinHandle<()>,
    }

    #[derive(Default)]
    struct Store {
        lists: Mutex<HashMap<String, VecDeque<Vec<u8>>>>,
        log: Mutex<Vec<(String, String)>>,
        stall_lpush: AtomicBool,
        fail_lpush: AtomicBool,
    }

    impl RedisStub {
        async fn start() -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let store = Arc::new(Store::default());
            let (kill, _) = watch::channel(0u64);
            let kill = Arc::new(kill);

            let accept = {
                let store = store.clone();
                let kill = kill.clone();
                tokio::spawn(async move {
                    while let Ok((stream, _)) = listener.accept().await {
                        tokio::spawn(serve(stream, store.clone(), kill.subscribe()));
                    }
                })
            };

            Self {
                addr,
                store,
                kill,
                accept,
            }
        }

        fn config(&self) -> RedisConfig {
            RedisConfig {
                url: Some(format!("redis://{}/", self.addr)),
                host: self.addr.ip().to_string(),
                port: self.addr.port(),
                queue_name: QUEUE.to_string(),
                poll_interval_ms: 50,
                health_check_interval_ms: 60_000,
                result_ttl_secs: 30,
            }
        }

        fn push(&self, key: &str, value: Vec<u8>) {
            self.store
                .lists
                .lock()
                .unwrap()
                .entry(key.to_string())
                .or_default()
                .push_front(value);
        }

        /// Contents of a list, head first
        fn list(&self, key: &str) -> Vec<Vec<u8>> {
            self.store
                .lists
                .lock()
                .unwrap()
                .get(key)
                .map(|list| list.iter().cloned().collect())
                .unwrap_or_default()
        }

        fn saw(&self, command: &str, key: &str) -> bool {
            self.store
                .log
                .lock()
                .unwrap()
                .iter()
                .any(|(name, arg)| name == command && arg == key)
        }

        /// Close every open client connection; new ones are still accepted
        fn drop_connections(&self) {
            self.kill.send_modify(|generation| *generation += 1);
        }
    }

    impl Drop for RedisStub {
        fn drop(&mut self) {
            self.accept.abort();
        }
    }

    async fn serve(stream: TcpStream, store: Arc<Store>, mut kill: watch::Receiver<u64>) {
        let (read, mut write) = stream.into_split();
        let mut reader = BufReader::new(read);
        let mut queued = None;

        loop {
            let args = tokio::select! {
                args = read_command(&mut reader) => match args {
                    Some(args) => args,
                    None => return,
                },
                _ = kill.changed() => return,
            };
            let reply = tokio::select! {
                reply = store.execute(args, &mut queued) => reply,
                _ = kill.changed() => return,
            };
            if write.write_all(&reply).await.is_err() {
                return;
            }
        }
    }

    async fn read_command(reader: &mut BufReader<OwnedReadHalf>) -> Option<Vec<Vec<u8>>> {
        let mut line = String::new();
        if reader.read_line(&mut line).await.ok()? == 0 {
            return None;
        }
        let count: usize = line.trim_end().strip_prefix('*')?.parse().ok()?;

        let mut args = Vec::with_capacity(count);
        for _ in 0..count {
            line.clear();
            reader.read_line(&mut line).await.ok()?;
            let len: usize = line.trim_end().strip_prefix('$')?.parse().ok()?;
            let mut buf = vec![0; len + 2];
            reader.read_exact(&mut buf).await.ok()?;
            buf.truncate(len);
            args.push(buf);
        }
        Some(args)
    }

    fn text(bytes: &[u8]) -> String {
        String::from_utf8_lossy(bytes).into_owned()
    }

    fn ok() -> Vec<u8> {
        b"+OK\r\n".to_vec()
    }

    fn int(n: usize) -> Vec<u8> {
        format!(":{}\r\n", n).into_bytes()
    }

    fn bulk(bytes: &[u8]) -> Vec<u8> {
        let mut out = format!("${}\r\n", bytes.len()).into_bytes();
        out.extend_from_slice(bytes);
        out.extend_from_slice(b"\r\n");
        out
    }

    impl Store {
        async fn execute(&self, args: Vec<Vec<u8>>, queued: &mut Option<Vec<Vec<Vec<u8>>>>) -> Vec<u8> {
            let Some(first) = args.first() else {
                return ok();
            };
            let name = text(first).to_uppercase();

            match name.as_str() {
                "MULTI" => {
                    *queued = Some(Vec::new());
                    return ok();
                }
                "EXEC" => {
                    let commands = queued.take().unwrap_or_default();
                    let mut out = format!("*{}\r\n", commands.len()).into_bytes();
                    for command in &commands {
                        out.extend(self.apply(command));
                    }
                    return out;
                }
                _ => {}
            }

            if let Some(transaction) = queued.as_mut() {
                transaction.push(args);
                return b"+QUEUED\r\n".to_vec();
            }

            match name.as_str() {
                "BRPOP" => self.brpop(&args).await,
                "LPUSH" if self.stall_lpush.load(Ordering::SeqCst) => std::future::pending().await,
                "LPUSH" if self.fail_lpush.load(Ordering::SeqCst) => b"-ERR push refused\r\n".to_vec(),
                _ => self.apply(&args),
            }
        }

        fn apply(&self, args: &[Vec<u8>]) -> Vec<u8> {
            let name = text(&args[0]).to_uppercase();
            let key = args.get(1).map(|k| text(k)).unwrap_or_default();
            self.log.lock().unwrap().push((name.clone(), key.clone()));

            let mut lists = self.lists.lock().unwrap();
            match name.as_str() {
                "LPUSH" => {
                    let list = lists.entry(key).or_default();
                    for value in &args[2..] {
                        list.push_front(value.clone());
                    }
                    int(list.len())
                }
                "DEL" => int(lists.remove(&key).map_or(0, |_| 1)),
                "EXPIRE" => int(1),
                "PING" => b"+PONG\r\n".to_vec(),
                _ => ok(),
            }
        }

        fn pop_any(&self, keys: &[String]) -> Option<(String, Vec<u8>)> {
            let mut lists = self.lists.lock().unwrap();
            keys.iter().find_map(|key| {
                lists
                    .get_mut(key)
                    .and_then(|list| list.pop_back())
                    .map(|value| (key.clone(), value))
            })
        }

        async fn brpop(&self, args: &[Vec<u8>]) -> Vec<u8> {
            let keys: Vec<String> = args[1..args.len() - 1].iter().map(|k| text(k)).collect();
            let timeout: f64 = text(&args[args.len() - 1]).parse().unwrap_or(0.0);
            let deadline = (timeout > 0.0)
                .then(|| tokio::time::Instant::now() + Duration::from_secs_f64(timeout));

            loop {
                if let Some((key, value)) = self.pop_any(&keys) {
                    let mut out = b"*2\r\n".to_vec();
                    out.extend(bulk(key.as_bytes()));
                    out.extend(bulk(&value));
                    return out;
                }
                if deadline.is_some_and(|deadline| tokio::time::Instant::now() >= deadline) {
                    return b"*-1\r\n".to_vec();
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
    }

    async fn eventually(check: impl Fn() -> bool) -> bool {
        for _ in 0..200 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        check()
    }

    fn job(prompt: &str) -> Job {
        Job::new(prompt, JobOptions::default())
    }

    #[tokio::test]
    async fn test_results_reach_their_own_waiters() {
        let stub = RedisStub::start().await;
        let broker = RedisBroker::connect(&stub.config()).await.unwrap();
        let a = job("a");
        let b = job("b");

        broker.enqueue(&a).await.unwrap();
        broker.enqueue(&b).await.unwrap();

        // LPUSHed, so the oldest job sits at the tail a worker BRPOPs from
        let queued = stub.list(QUEUE);
        assert_eq!(queued.len(), 2);
        assert_eq!(jobs::decode(&queued[1]).unwrap(), a);

        let for_b = JobResult::success(b.id, json!({ "answer": "b" }));
        stub.push(&response_key(QUEUE, b.id), jobs::encode_result(&for_b).unwrap());
        stub.push(&response_key(QUEUE, a.id), br#"{"payload":{"answer":"a"}}"#.to_vec());

        let (got_a, got_b) = tokio::join!(
            broker.await_result(a.id, Duration::from_secs(5)),
            broker.await_result(b.id, Duration::from_secs(5)),
        );

        let Delivery::Ready(got_a) = got_a.unwrap() else {
            panic!("expected a result for a");
        };
        let Delivery::Ready(got_b) = got_b.unwrap() else {
            panic!("expected a result for b");
        };
        assert_eq!(got_a.job_id, a.id);
        assert_eq!(got_a.outcome, Outcome::Payload(json!({ "answer": "a" })));
        assert_eq!(got_b.outcome, Outcome::Payload(json!({ "answer": "b" })));
        assert!(broker.registry.is_empty());
    }

    #[tokio::test]
    async fn test_timed_out_response_key_is_deleted() {
        let stub = RedisStub::start().await;
        let broker = RedisBroker::connect(&stub.config()).await.unwrap();
        let job = job("hello");
        let key = response_key(QUEUE, job.id);

        broker.enqueue(&job).await.unwrap();
        let delivery = broker
            .await_result(job.id, Duration::from_millis(150))
            .await
            .unwrap();

        assert_eq!(delivery, Delivery::TimedOut);
        assert!(broker.registry.is_empty());
        assert!(eventually(|| stub.saw("DEL", &key)).await);
    }

    #[tokio::test]
    async fn test_connection_loss_fails_pending_wait() {
        let stub = RedisStub::start().await;
        let broker = Arc::new(RedisBroker::connect(&stub.config()).await.unwrap());
        let job = job("hello");
        broker.enqueue(&job).await.unwrap();

        let waiter = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.await_result(job.id, Duration::from_secs(30)).await })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;
        stub.drop_connections();

        let err = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("waiter should fail fast")
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, BrokerError::Disconnected(_)));
        assert!(broker.registry.is_empty());

        let response = AppError::from(err);
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response.body()["error"], "Internal server error");

        // the dispatcher reconnects for later requests
        assert!(eventually(|| broker.status().connected).await);
    }

    #[tokio::test]
    async fn test_cancelled_enqueue_releases_registration() {
        let stub = RedisStub::start().await;
        stub.store.stall_lpush.store(true, Ordering::SeqCst);
        let broker = Arc::new(RedisBroker::connect(&stub.config()).await.unwrap());

        let enqueue = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.enqueue(&job("hello")).await })
        };
        assert!(eventually(|| broker.registry.len() == 1).await);

        tokio::time::sleep(Duration::from_millis(100)).await;
        enqueue.abort();
        let _ = enqueue.await;

        assert!(broker.registry.is_empty());
        assert!(broker.registry.pending_keys().is_empty());
    }

    #[tokio::test]
    async fn test_failed_push_rolls_back_registration() {
        let stub = RedisStub::start().await;
        stub.store.fail_lpush.store(true, Ordering::SeqCst);
        let broker = RedisBroker::connect(&stub.config()).await.unwrap();

        let err = broker.enqueue(&job("hello")).await.unwrap_err();

        assert!(matches!(err, BrokerError::Redis(_)));
        assert!(broker.registry.is_empty());
        // a refused command is not a lost connection
        assert!(broker.status().connected);
    }

    #[tokio::test]
    async fn test_health_check_waits_for_dispatcher_before_reporting_up() {
        let stub = RedisStub::start().await;
        let conn = ConnectionManager::new(Client::open(stub.config().url()).unwrap())
            .await
            .unwrap();
        let (status, _) = watch::channel(BrokerStatus::disconnected("connection reset"));
        let status = Arc::new(status);
        let delivering = Arc::new(AtomicBool::new(false));

        let task = tokio::spawn(health_check(
            conn,
            status.clone(),
            delivering.clone(),
            Duration::from_millis(20),
        ));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!status.borrow().connected);

        delivering.store(true, Ordering::SeqCst);
        assert!(eventually(|| status.borrow().connected).await);
        task.abort();
    }

    #[tokio::test]
    async fn test_job_source_pops_and_publishes_with_expiry() {
        let stub = RedisStub::start().await;
        let source = RedisJobSource::connect(&stub.config()).await.unwrap();

        assert!(source.next_job().await.unwrap().is_none());

        let job = job("hello");
        stub.push(QUEUE, jobs::encode(&job).unwrap());
        let bytes = source.next_job().await.unwrap().unwrap();
        assert_eq!(jobs::decode(&bytes).unwrap(), job);

        let result = JobResult::success(job.id, json!({ "answer": "hi" }));
        source.publish(&result).await.unwrap();

        let key = response_key(QUEUE, job.id);
        assert_eq!(stub.list(&key), vec![jobs::encode_result(&result).unwrap()]);
        assert!(stub.saw("EXPIRE", &key));
    }
}
