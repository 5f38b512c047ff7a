//! Device session management
//!
//! One `DeviceSession` owns one live connection to one device. Outbound
//! sentences get a monotonic per-session tag; a background reader task
//! decodes inbound sentences and routes them to the pending command that
//! registered the tag. Many commands may be outstanding at once and they
//! complete independently, in whatever order the device answers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::{RosSrvError, Result};
use crate::protocol::{auth, encode_to_vec, ReplyKind, Sentence, SentenceDecoder};
use crate::types::{DeviceId, Tag};

/// Global session id source, shared by all pools
static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Session tuning knobs
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Default per-command reply timeout
    pub command_timeout: Duration,
    /// Sessions older than this are recycled by the pool
    pub max_lifetime: Duration,
    /// Sessions with at least this many errors are recycled
    pub error_ceiling: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(10),
            max_lifetime: Duration::from_secs(30 * 60),
            error_ceiling: 10,
        }
    }
}

/// A command awaiting its tagged reply stream
struct PendingCommand {
    submitted_at: Instant,
    replies: Vec<Sentence>,
    resolver: oneshot::Sender<Result<Vec<Sentence>>>,
}

type PendingMap = Arc<StdMutex<HashMap<Tag, PendingCommand>>>;

/// One live connection to one device
pub struct DeviceSession {
    id: u64,
    device_id: DeviceId,
    writer: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    pending: PendingMap,
    /// Monotonic, starts at 1; a tag is reused only after its command
    /// resolved or the session was torn down
    tag_counter: AtomicU32,
    authenticated: AtomicBool,
    open: Arc<AtomicBool>,
    error_count: Arc<AtomicU32>,
    last_activity: Arc<StdMutex<Instant>>,
    created_at: Instant,
    config: SessionConfig,
    reader_handle: StdMutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSession")
            .field("id", &self.id)
            .field("device_id", &self.device_id)
            .field("open", &self.is_open())
            .field("error_count", &self.error_count.load(Ordering::Relaxed))
            .finish()
    }
}

impl DeviceSession {
    /// Open a TCP connection and wrap it in a session. Authentication is a
    /// separate step; the pool drives it right after connect.
    pub async fn connect(
        device_id: DeviceId,
        addr: &str,
        connect_timeout: Duration,
        config: SessionConfig,
    ) -> Result<Self> {
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| RosSrvError::timeout(format!("Connect to {addr} timed out")))?
            .map_err(|e| RosSrvError::ConnectionError(format!("Connect to {addr}: {e}")))?;
        stream
            .set_nodelay(true)
            .map_err(|e| RosSrvError::ConnectionError(format!("set_nodelay: {e}")))?;
        Ok(Self::from_stream(device_id, stream, config))
    }

    /// Build a session over any byte stream (tests use in-memory duplex
    /// pipes, production uses TCP)
    pub fn from_stream<S>(device_id: DeviceId, stream: S, config: SessionConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);

        let pending: PendingMap = Arc::new(StdMutex::new(HashMap::new()));
        let open = Arc::new(AtomicBool::new(true));
        let error_count = Arc::new(AtomicU32::new(0));
        let last_activity = Arc::new(StdMutex::new(Instant::now()));

        let reader_handle = tokio::spawn(Self::reader_loop(
            device_id,
            read_half,
            pending.clone(),
            open.clone(),
            last_activity.clone(),
        ));

        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            device_id,
            writer: Mutex::new(Box::new(write_half)),
            pending,
            tag_counter: AtomicU32::new(1),
            authenticated: AtomicBool::new(false),
            open,
            error_count,
            last_activity,
            created_at: Instant::now(),
            config,
            reader_handle: StdMutex::new(Some(reader_handle)),
        }
    }

    /// Inbound half: decode sentences and route them by tag until the
    /// socket closes, then fail everything still pending.
    async fn reader_loop<R>(
        device_id: DeviceId,
        mut reader: tokio::io::ReadHalf<R>,
        pending: PendingMap,
        open: Arc<AtomicBool>,
        last_activity: Arc<StdMutex<Instant>>,
    ) where
        R: AsyncRead + AsyncWrite + Send + 'static,
    {
        let mut decoder = SentenceDecoder::new();
        let mut buf = [0u8; 4096];

        'io: loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    debug!(device_id = %device_id, error = %e, "Session read failed");
                    break;
                },
            };
            decoder.extend(&buf[..n]);

            loop {
                let sentence = match decoder.next_sentence() {
                    Ok(Some(s)) => s,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(device_id = %device_id, error = %e, "Protocol desync, closing session");
                        break 'io;
                    },
                };

                if let Ok(mut at) = last_activity.lock() {
                    *at = Instant::now();
                }

                if sentence.reply_kind() == Some(ReplyKind::Fatal) {
                    warn!(
                        device_id = %device_id,
                        message = sentence.message().unwrap_or("none"),
                        "Device sent !fatal, closing session"
                    );
                    break 'io;
                }

                Self::route_reply(device_id, &pending, sentence);
            }
        }

        open.store(false, Ordering::SeqCst);
        Self::fail_all_pending(&pending, "Connection closed with commands outstanding");
    }

    /// Deliver one reply sentence to its pending command, if any.
    ///
    /// `!re` accumulates, `!done` resolves with everything accumulated
    /// (terminal sentence included, its attributes matter for `/login`),
    /// `!trap` fails the command with the device's message. Replies with
    /// no tag or an unknown tag are dropped.
    fn route_reply(device_id: DeviceId, pending: &PendingMap, sentence: Sentence) {
        let Some(tag) = sentence.tag() else {
            trace!(device_id = %device_id, "Dropping untagged reply");
            return;
        };

        let Ok(mut map) = pending.lock() else {
            return;
        };

        match sentence.reply_kind() {
            Some(ReplyKind::Data) => {
                if let Some(cmd) = map.get_mut(&tag) {
                    cmd.replies.push(sentence);
                } else {
                    trace!(device_id = %device_id, tag = %tag, "Dropping reply for unknown tag");
                }
            },
            Some(ReplyKind::Done) => {
                if let Some(mut cmd) = map.remove(&tag) {
                    cmd.replies.push(sentence);
                    let elapsed = cmd.submitted_at.elapsed();
                    trace!(device_id = %device_id, tag = %tag, ?elapsed, "Command done");
                    let _ = cmd.resolver.send(Ok(cmd.replies));
                }
            },
            Some(ReplyKind::Trap) => {
                if let Some(cmd) = map.remove(&tag) {
                    let message = sentence.message().unwrap_or("unspecified trap").to_string();
                    let _ = cmd.resolver.send(Err(RosSrvError::ProtocolError(message)));
                }
            },
            _ => {
                trace!(device_id = %device_id, tag = %tag, "Dropping non-reply sentence");
            },
        }
    }

    fn fail_all_pending(pending: &PendingMap, reason: &str) {
        let drained: Vec<PendingCommand> = match pending.lock() {
            Ok(mut map) => map.drain().map(|(_, cmd)| cmd).collect(),
            Err(_) => return,
        };
        for cmd in drained {
            let _ = cmd
                .resolver
                .send(Err(RosSrvError::connection_lost(reason)));
        }
    }

    /// Send a sentence and await its complete reply stream, using the
    /// session's default command timeout.
    pub async fn send(&self, sentence: Sentence) -> Result<Vec<Sentence>> {
        self.send_with_timeout(sentence, self.config.command_timeout)
            .await
    }

    /// Send a sentence and await its complete reply stream
    pub async fn send_with_timeout(
        &self,
        mut sentence: Sentence,
        timeout: Duration,
    ) -> Result<Vec<Sentence>> {
        if !self.is_open() {
            return Err(RosSrvError::connection_lost("Session is closed"));
        }

        let tag = Tag(self.tag_counter.fetch_add(1, Ordering::Relaxed));
        sentence.set_tag(tag);

        let (resolver, rx) = oneshot::channel();
        {
            let mut map = self
                .pending
                .lock()
                .map_err(|_| RosSrvError::internal("Pending map poisoned"))?;
            map.insert(
                tag,
                PendingCommand {
                    submitted_at: Instant::now(),
                    replies: Vec::new(),
                    resolver,
                },
            );
        }

        if let Err(e) = self.write_sentence(&sentence).await {
            self.remove_pending(tag);
            self.error_count.fetch_add(1, Ordering::Relaxed);
            return Err(e);
        }
        self.touch();

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => {
                if result.is_err() {
                    self.error_count.fetch_add(1, Ordering::Relaxed);
                }
                result
            },
            Ok(Err(_)) => {
                // Resolver dropped without sending: session torn down
                Err(RosSrvError::connection_lost("Session torn down"))
            },
            Err(_) => {
                self.remove_pending(tag);
                self.error_count.fetch_add(1, Ordering::Relaxed);
                Err(RosSrvError::TimeoutError(format!(
                    "No reply for tag {tag} within {timeout:?}"
                )))
            },
        }
    }

    /// Run several commands concurrently on this session, each under its
    /// own tag; results come back in submission order.
    pub async fn send_batch(&self, sentences: Vec<Sentence>) -> Vec<Result<Vec<Sentence>>> {
        futures::future::join_all(sentences.into_iter().map(|s| self.send(s))).await
    }

    async fn write_sentence(&self, sentence: &Sentence) -> Result<()> {
        let bytes = encode_to_vec(sentence);
        let mut writer = self.writer.lock().await;
        writer.write_all(&bytes).await.map_err(|e| {
            self.open.store(false, Ordering::SeqCst);
            RosSrvError::from(e)
        })?;
        writer.flush().await.map_err(RosSrvError::from)
    }

    /// Drive the login handshake. Challenge flow first; if the device
    /// replies without a challenge the plaintext variant already succeeded
    /// on newer firmware, so fall back to it explicitly.
    pub async fn authenticate(&self, username: &str, password: &str) -> Result<()> {
        let replies = self.send(auth::build_login_probe()).await.map_err(|e| {
            // A trap on the bare probe is an auth refusal, not a protocol bug
            match e {
                RosSrvError::ProtocolError(msg) => RosSrvError::AuthenticationError(msg),
                other => other,
            }
        })?;

        let done = replies
            .last()
            .ok_or_else(|| RosSrvError::auth("Empty login reply"))?;

        let final_reply = match auth::extract_challenge(done) {
            Ok(challenge) => {
                let response = auth::challenge_response(password, &challenge);
                self.send(auth::build_login_response(username, &response))
                    .await
            },
            Err(_) => {
                // No challenge offered: plaintext flow
                self.send(auth::build_plain_login(username, password)).await
            },
        }
        .map_err(|e| match e {
            RosSrvError::ProtocolError(msg) => RosSrvError::AuthenticationError(msg),
            other => other,
        })?;

        if let Some(reply) = final_reply.last() {
            auth::check_login_reply(reply)?;
        }
        self.authenticated.store(true, Ordering::SeqCst);
        debug!(device_id = %self.device_id, session_id = self.id, "Session authenticated");
        Ok(())
    }

    fn remove_pending(&self, tag: Tag) {
        if let Ok(mut map) = self.pending.lock() {
            map.remove(&tag);
        }
    }

    fn touch(&self) {
        if let Ok(mut at) = self.last_activity.lock() {
            *at = Instant::now();
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    pub fn error_count(&self) -> u32 {
        self.error_count.load(Ordering::Relaxed)
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn idle_time(&self) -> Duration {
        self.last_activity
            .lock()
            .map(|at| at.elapsed())
            .unwrap_or_default()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().map(|m| m.len()).unwrap_or(0)
    }

    /// Usable means: socket open, not past its lifetime, error count below
    /// the ceiling. The pool recycles sessions that fail this predicate.
    pub fn is_usable(&self) -> bool {
        self.is_open()
            && self.age() < self.config.max_lifetime
            && self.error_count() < self.config.error_ceiling
    }

    /// Close the session: stop the reader and fail anything outstanding.
    pub fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        if let Ok(mut handle) = self.reader_handle.lock() {
            if let Some(h) = handle.take() {
                h.abort();
            }
        }
        Self::fail_all_pending(&self.pending, "Session closed");
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::protocol::encode_to_vec;
    use tokio::io::DuplexStream;

    /// Spawn a scripted device on the far end of a duplex pipe. The
    /// handler maps each inbound sentence to the replies to send back.
    pub(crate) fn spawn_mock_device<F>(server: DuplexStream, handler: F)
    where
        F: Fn(&Sentence) -> Vec<Sentence> + Send + 'static,
    {
        tokio::spawn(async move {
            let (mut reader, mut writer) = tokio::io::split(server);
            let mut decoder = SentenceDecoder::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = match reader.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                };
                decoder.extend(&buf[..n]);
                while let Ok(Some(sentence)) = decoder.next_sentence() {
                    for reply in handler(&sentence) {
                        if writer.write_all(&encode_to_vec(&reply)).await.is_err() {
                            return;
                        }
                    }
                    let _ = writer.flush().await;
                }
            }
        });
    }

    /// Standard echo device: answers every command with one !re and a !done
    /// carrying the same tag.
    pub(crate) fn echo_device(server: DuplexStream) {
        spawn_mock_device(server, |sentence| {
            let tag = sentence.tag().expect("outbound sentence must carry a tag");
            let path = sentence.first().unwrap_or("").to_string();
            vec![
                Sentence::from_words(vec![
                    "!re".into(),
                    format!("=echo={path}"),
                    format!(".tag={}", tag.0),
                ]),
                Sentence::from_words(vec!["!done".into(), format!(".tag={}", tag.0)]),
            ]
        });
    }

    fn test_session(server_behavior: impl FnOnce(DuplexStream)) -> DeviceSession {
        let (client, server) = tokio::io::duplex(64 * 1024);
        server_behavior(server);
        DeviceSession::from_stream(DeviceId(1), client, SessionConfig::default())
    }

    #[tokio::test]
    async fn test_send_resolves_on_done() {
        let session = test_session(echo_device);
        let replies = session
            .send(Sentence::from_command("/interface/print").unwrap())
            .await
            .unwrap();
        // One !re plus the terminal !done
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0].attribute("echo"), Some("/interface/print"));
        assert_eq!(replies[1].reply_kind(), Some(ReplyKind::Done));
        assert_eq!(session.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_tag_correlation_with_interleaved_replies() {
        // Device answers tag 1 and tag 2 with their !re sentences
        // interleaved and the !done replies in reverse submission order.
        let (client, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            let (mut reader, mut writer) = tokio::io::split(server);
            let mut decoder = SentenceDecoder::new();
            let mut buf = [0u8; 4096];
            let mut tags = Vec::new();
            while tags.len() < 2 {
                let n = reader.read(&mut buf).await.unwrap();
                decoder.extend(&buf[..n]);
                while let Ok(Some(s)) = decoder.next_sentence() {
                    tags.push(s.tag().unwrap());
                }
            }
            let (t1, t2) = (tags[0], tags[1]);
            for reply in [
                Sentence::from_words(vec!["!re".into(), "=n=a".into(), format!(".tag={}", t1.0)]),
                Sentence::from_words(vec!["!re".into(), "=n=x".into(), format!(".tag={}", t2.0)]),
                Sentence::from_words(vec!["!re".into(), "=n=b".into(), format!(".tag={}", t1.0)]),
                Sentence::from_words(vec!["!done".into(), format!(".tag={}", t2.0)]),
                Sentence::from_words(vec!["!done".into(), format!(".tag={}", t1.0)]),
            ] {
                writer.write_all(&encode_to_vec(&reply)).await.unwrap();
            }
            writer.flush().await.unwrap();
            // Keep the connection up until the client is done
            let _ = reader.read(&mut buf).await;
        });

        let session = Arc::new(DeviceSession::from_stream(
            DeviceId(1),
            client,
            SessionConfig::default(),
        ));

        let s1 = session.clone();
        let s2 = session.clone();
        let (r1, r2) = tokio::join!(
            s1.send(Sentence::from_command("/a/print").unwrap()),
            s2.send(Sentence::from_command("/x/print").unwrap()),
        );

        let r1 = r1.unwrap();
        let r2 = r2.unwrap();
        // First command saw its two !re records in order, second saw one
        assert_eq!(r1[0].attribute("n"), Some("a"));
        assert_eq!(r1[1].attribute("n"), Some("b"));
        assert_eq!(r2[0].attribute("n"), Some("x"));
    }

    #[tokio::test]
    async fn test_trap_fails_command_with_device_message() {
        let session = test_session(|server| {
            spawn_mock_device(server, |sentence| {
                let tag = sentence.tag().unwrap();
                vec![Sentence::from_words(vec![
                    "!trap".into(),
                    "=message=no such command".into(),
                    format!(".tag={}", tag.0),
                ])]
            })
        });

        let err = session
            .send(Sentence::from_command("/bogus").unwrap())
            .await
            .unwrap_err();
        match err {
            RosSrvError::ProtocolError(msg) => assert_eq!(msg, "no such command"),
            other => panic!("expected ProtocolError, got {other:?}"),
        }
        assert_eq!(session.error_count(), 1);
    }

    #[tokio::test]
    async fn test_connection_loss_fails_pending() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let session = DeviceSession::from_stream(DeviceId(1), client, SessionConfig::default());

        // Device hangs up while a command is outstanding
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(server);
        });

        let err = session
            .send(Sentence::from_command("/system/resource/print").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, RosSrvError::ConnectionLost(_)));
        assert!(!session.is_open());

        // A closed session must refuse further work
        let err = session
            .send(Sentence::from_command("/system/resource/print").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, RosSrvError::ConnectionLost(_)));
    }

    #[tokio::test]
    async fn test_command_timeout_releases_pending_slot() {
        // Device reads but never answers
        let session = test_session(|server| {
            spawn_mock_device(server, |_| Vec::new());
        });

        let err = session
            .send_with_timeout(
                Sentence::from_command("/slow/print").unwrap(),
                Duration::from_millis(100),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RosSrvError::TimeoutError(_)));
        assert_eq!(session.pending_count(), 0);
        assert_eq!(session.error_count(), 1);
    }

    #[tokio::test]
    async fn test_unmatched_tag_is_dropped() {
        let session = test_session(|server| {
            spawn_mock_device(server, |sentence| {
                let tag = sentence.tag().unwrap();
                vec![
                    // Reply for a tag nobody registered
                    Sentence::from_words(vec!["!done".into(), ".tag=9999".into()]),
                    Sentence::from_words(vec!["!done".into(), format!(".tag={}", tag.0)]),
                ]
            })
        });

        let replies = session
            .send(Sentence::from_command("/ok").unwrap())
            .await
            .unwrap();
        assert_eq!(replies.len(), 1);
    }

    #[tokio::test]
    async fn test_authenticate_challenge_flow() {
        let session = test_session(|server| {
            spawn_mock_device(server, |sentence| {
                let tag = sentence.tag().unwrap();
                let tag_word = format!(".tag={}", tag.0);
                if sentence.attribute("response").is_some() {
                    // Stage two: accept any well-formed response
                    let resp = sentence.attribute("response").unwrap();
                    if resp.starts_with("00") && resp.len() == 34 {
                        vec![Sentence::from_words(vec!["!done".into(), tag_word])]
                    } else {
                        vec![Sentence::from_words(vec![
                            "!trap".into(),
                            "=message=invalid response".into(),
                            tag_word,
                        ])]
                    }
                } else {
                    // Stage one: offer a challenge
                    vec![Sentence::from_words(vec![
                        "!done".into(),
                        "=ret=1a2b3c4d".into(),
                        tag_word,
                    ])]
                }
            })
        });

        session.authenticate("admin", "secret").await.unwrap();
        assert!(session.is_authenticated());
    }

    #[tokio::test]
    async fn test_authenticate_rejected() {
        let session = test_session(|server| {
            spawn_mock_device(server, |sentence| {
                let tag = sentence.tag().unwrap();
                let tag_word = format!(".tag={}", tag.0);
                if sentence.attribute("response").is_some() {
                    vec![Sentence::from_words(vec![
                        "!trap".into(),
                        "=message=cannot log in".into(),
                        tag_word,
                    ])]
                } else {
                    vec![Sentence::from_words(vec![
                        "!done".into(),
                        "=ret=1a2b3c4d".into(),
                        tag_word,
                    ])]
                }
            })
        });

        let err = session.authenticate("admin", "wrong").await.unwrap_err();
        assert!(matches!(err, RosSrvError::AuthenticationError(_)));
        assert!(!session.is_authenticated());
    }

    #[tokio::test]
    async fn test_send_batch_runs_concurrently() {
        let session = test_session(echo_device);
        let commands = vec![
            Sentence::from_command("/a").unwrap(),
            Sentence::from_command("/b").unwrap(),
            Sentence::from_command("/c").unwrap(),
        ];
        let results = session.send_batch(commands).await;
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].as_ref().unwrap()[0].attribute("echo"), Some("/a"));
        assert_eq!(results[2].as_ref().unwrap()[0].attribute("echo"), Some("/c"));
    }

    #[tokio::test]
    async fn test_usability_predicate() {
        let session = test_session(echo_device);
        assert!(session.is_usable());

        session.close();
        assert!(!session.is_usable());
    }
}
