//! Registry backend speaking the RESP wire protocol over TCP.
//!
//! Commands are encoded as arrays of bulk strings; replies are the five RESP
//! reply kinds. One connection serves request/response traffic (serialized
//! behind a mutex, batched for pipelines); every subscription dials its own
//! connection so a blocked consume cannot starve commands.
//!
//! URIs follow `scheme://host:port/db?`; a non-zero db is selected right
//! after connect and determines the keyspace expiry-event channel name.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use snafu::ResultExt;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufStream;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

use super::Consumed;
use super::IoSnafu;
use super::PipelineCommand;
use super::Registry;
use super::RegistryError;
use super::Result;
use super::Subscription;
use super::db_from_uri;
use super::expired_channel_for_db;

/// Round-trip budget for a single command.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);
/// Subscription read timeout, surfaced as [`Consumed::Timeout`].
const CONSUME_TIMEOUT: Duration = Duration::from_millis(100);
/// COUNT hint passed to SCAN.
const SCAN_COUNT: &str = "512";

/// Owner-checked delete used for lock release.
const DEL_EQ_SCRIPT: &str =
    r#"if redis.call("get", KEYS[1]) == ARGV[1] then return redis.call("del", KEYS[1]) else return 0 end"#;

/// A parsed RESP reply.
#[derive(Debug, Clone, PartialEq)]
enum Reply {
    Simple(String),
    Error(String),
    Int(i64),
    Bulk(Option<String>),
    Array(Option<Vec<Reply>>),
}

/// RESP-over-TCP implementation of [`Registry`].
pub struct RespRegistry {
    addr: String,
    db: u32,
    conn: Mutex<Option<BufStream<TcpStream>>>,
}

impl RespRegistry {
    /// Connect to the registry at `uri` and select its database.
    pub async fn connect(uri: &str) -> Result<Self> {
        let addr = host_port(uri)?;
        let db = db_from_uri(uri);
        let registry = Self {
            addr,
            db,
            conn: Mutex::new(None),
        };
        // fail fast when the server is unreachable at startup
        let mut guard = registry.conn.lock().await;
        *guard = Some(registry.dial().await?);
        drop(guard);
        debug!(uri, db, "connected to registry");
        Ok(registry)
    }

    async fn dial(&self) -> Result<BufStream<TcpStream>> {
        let stream = TcpStream::connect(&self.addr).await.context(IoSnafu { op: "connect" })?;
        let mut conn = BufStream::new(stream);
        if self.db != 0 {
            let db = self.db.to_string();
            let args = [b"SELECT".as_ref(), db.as_bytes()];
            write_command(&mut conn, &args).await?;
            conn.flush().await.context(IoSnafu { op: "connect" })?;
            match read_reply(&mut conn, "connect").await? {
                Reply::Simple(_) => {}
                other => return Err(protocol("connect", format!("SELECT failed: {other:?}"))),
            }
        }
        Ok(conn)
    }

    /// Send one command and read its reply, reconnecting once on a dead
    /// connection. Any i/o failure drops the connection so the next caller
    /// redials.
    async fn command(&self, op: &'static str, args: &[&[u8]]) -> Result<Reply> {
        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            *guard = Some(self.dial().await?);
        }
        let conn = guard.as_mut().unwrap_or_else(|| unreachable!("connection dialed above"));
        let round_trip = async {
            write_command(conn, args).await?;
            conn.flush().await.context(IoSnafu { op })?;
            read_reply(conn, op).await
        };
        let result = match tokio::time::timeout(COMMAND_TIMEOUT, round_trip).await {
            Ok(result) => result,
            Err(_) => Err(RegistryError::Timeout { op }),
        };
        if result.is_err() {
            *guard = None;
        }
        match result? {
            Reply::Error(message) => Err(protocol(op, message)),
            reply => Ok(reply),
        }
    }

    async fn command_str(&self, op: &'static str, args: &[&str]) -> Result<Reply> {
        let raw: Vec<&[u8]> = args.iter().map(|a| a.as_bytes()).collect();
        self.command(op, &raw).await
    }
}

#[async_trait]
impl Registry for RespRegistry {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        expect_bulk(self.command_str("get", &["GET", key]).await?, "get")
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.command_str("set", &["SET", key, value]).await.map(|_| ())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let secs = ttl.as_secs().max(1).to_string();
        self.command_str("setex", &["SETEX", key, &secs, value]).await.map(|_| ())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let millis = ttl.as_millis().max(1).to_string();
        match self.command_str("set", &["SET", key, value, "NX", "PX", &millis]).await? {
            Reply::Simple(_) => Ok(true),
            Reply::Bulk(None) | Reply::Array(None) => Ok(false),
            other => Err(protocol("set", format!("unexpected SET NX reply: {other:?}"))),
        }
    }

    async fn del(&self, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut args = vec!["DEL".to_string()];
        args.extend_from_slice(keys);
        let refs: Vec<&str> = args.iter().map(String::as_str).collect();
        expect_int(self.command_str("del", &refs).await?, "del").map(|n| n as u64)
    }

    async fn del_eq(&self, key: &str, expected: &str) -> Result<bool> {
        let reply = self
            .command_str("eval", &["EVAL", DEL_EQ_SCRIPT, "1", key, expected])
            .await?;
        expect_int(reply, "eval").map(|n| n == 1)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let secs = ttl.as_secs().max(1).to_string();
        expect_int(self.command_str("expire", &["EXPIRE", key, &secs]).await?, "expire").map(|n| n == 1)
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        expect_int(self.command_str("incr", &["INCR", key]).await?, "incr")
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut args = vec!["MGET".to_string()];
        args.extend_from_slice(keys);
        let refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let replies = expect_array(self.command_str("mget", &refs).await?, "mget")?;
        replies.into_iter().map(|r| expect_bulk(r, "mget")).collect()
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>> {
        let mut cursor = "0".to_string();
        let mut keys = Vec::new();
        loop {
            let reply = self
                .command_str("scan", &["SCAN", &cursor, "MATCH", pattern, "COUNT", SCAN_COUNT])
                .await?;
            let mut parts = expect_array(reply, "scan")?.into_iter();
            cursor = match parts.next() {
                Some(r) => expect_bulk(r, "scan")?.unwrap_or_default(),
                None => return Err(protocol("scan", "missing cursor".into())),
            };
            if let Some(batch) = parts.next() {
                for r in expect_array(batch, "scan")? {
                    if let Some(k) = expect_bulk(r, "scan")? {
                        keys.push(k);
                    }
                }
            }
            if cursor == "0" {
                break;
            }
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn hset(&self, key: &str, fields: &[(String, String)]) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut args = vec!["HSET".to_string(), key.to_string()];
        for (f, v) in fields {
            args.push(f.clone());
            args.push(v.clone());
        }
        let refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.command_str("hset", &refs).await.map(|_| ())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        expect_bulk(self.command_str("hget", &["HGET", key, field]).await?, "hget")
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let replies = expect_array(self.command_str("hgetall", &["HGETALL", key]).await?, "hgetall")?;
        let mut map = HashMap::with_capacity(replies.len() / 2);
        let mut it = replies.into_iter();
        while let (Some(f), Some(v)) = (it.next(), it.next()) {
            if let (Some(f), Some(v)) = (expect_bulk(f, "hgetall")?, expect_bulk(v, "hgetall")?) {
                map.insert(f, v);
            }
        }
        Ok(map)
    }

    async fn hsetnx(&self, key: &str, field: &str, value: &str) -> Result<bool> {
        expect_int(self.command_str("hsetnx", &["HSETNX", key, field, value]).await?, "hsetnx").map(|n| n == 1)
    }

    async fn hdel(&self, key: &str, fields: &[String]) -> Result<u64> {
        if fields.is_empty() {
            return Ok(0);
        }
        let mut args = vec!["HDEL".to_string(), key.to_string()];
        args.extend_from_slice(fields);
        let refs: Vec<&str> = args.iter().map(String::as_str).collect();
        expect_int(self.command_str("hdel", &refs).await?, "hdel").map(|n| n as u64)
    }

    async fn rpush(&self, key: &str, values: &[String]) -> Result<u64> {
        if values.is_empty() {
            return Ok(0);
        }
        let mut args = vec!["RPUSH".to_string(), key.to_string()];
        args.extend_from_slice(values);
        let refs: Vec<&str> = args.iter().map(String::as_str).collect();
        expect_int(self.command_str("rpush", &refs).await?, "rpush").map(|n| n as u64)
    }

    async fn lrange(&self, key: &str) -> Result<Vec<String>> {
        let replies = expect_array(self.command_str("lrange", &["LRANGE", key, "0", "-1"]).await?, "lrange")?;
        let mut out = Vec::with_capacity(replies.len());
        for r in replies {
            if let Some(v) = expect_bulk(r, "lrange")? {
                out.push(v);
            }
        }
        Ok(out)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<u64> {
        expect_int(self.command_str("publish", &["PUBLISH", channel, payload]).await?, "publish").map(|n| n as u64)
    }

    async fn subscribe(&self, channels: &[String]) -> Result<Box<dyn Subscription>> {
        let mut conn = self.dial().await?;
        let mut args = vec!["SUBSCRIBE".to_string()];
        args.extend_from_slice(channels);
        let raw: Vec<&[u8]> = args.iter().map(|a| a.as_bytes()).collect();
        write_command(&mut conn, &raw).await?;
        conn.flush().await.context(IoSnafu { op: "subscribe" })?;
        Ok(Box::new(RespSubscription { conn }))
    }

    async fn pipeline(&self, commands: Vec<PipelineCommand>) -> Result<()> {
        if commands.is_empty() {
            return Ok(());
        }
        let encoded: Vec<Vec<Vec<u8>>> = commands.iter().flat_map(encode_pipeline_command).collect();
        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            *guard = Some(self.dial().await?);
        }
        let conn = guard.as_mut().unwrap_or_else(|| unreachable!("connection dialed above"));
        let round_trip = async {
            write_command(conn, &[b"MULTI".as_ref()]).await?;
            for cmd in &encoded {
                let refs: Vec<&[u8]> = cmd.iter().map(Vec::as_slice).collect();
                write_command(conn, &refs).await?;
            }
            write_command(conn, &[b"EXEC".as_ref()]).await?;
            conn.flush().await.context(IoSnafu { op: "pipeline" })?;
            // MULTI reply, one QUEUED per command, then the EXEC array
            for _ in 0..encoded.len() + 2 {
                if let Reply::Error(message) = read_reply(conn, "pipeline").await? {
                    return Err(protocol("pipeline", message));
                }
            }
            Ok(())
        };
        let result = match tokio::time::timeout(COMMAND_TIMEOUT, round_trip).await {
            Ok(result) => result,
            Err(_) => Err(RegistryError::Timeout { op: "pipeline" }),
        };
        if result.is_err() {
            *guard = None;
        }
        result
    }

    async fn enable_expiry_events(&self) -> Result<()> {
        self.command_str("config", &["CONFIG", "SET", "notify-keyspace-events", "AKE"])
            .await
            .map(|_| ())
    }

    fn expired_event_channel(&self) -> String {
        expired_channel_for_db(self.db)
    }
}

struct RespSubscription {
    conn: BufStream<TcpStream>,
}

#[async_trait]
impl Subscription for RespSubscription {
    async fn consume(&mut self) -> Result<Consumed> {
        loop {
            let reply = match tokio::time::timeout(CONSUME_TIMEOUT, read_reply(&mut self.conn, "subscribe")).await {
                Ok(reply) => reply?,
                Err(_) => return Ok(Consumed::Timeout),
            };
            let Reply::Array(Some(items)) = reply else {
                return Err(protocol("subscribe", "push message is not an array".into()));
            };
            let mut it = items.into_iter();
            let kind = match it.next() {
                Some(Reply::Bulk(Some(k))) => k,
                other => return Err(protocol("subscribe", format!("bad push kind: {other:?}"))),
            };
            match kind.as_str() {
                "message" => {
                    let channel = match it.next() {
                        Some(Reply::Bulk(Some(c))) => c,
                        other => return Err(protocol("subscribe", format!("bad channel: {other:?}"))),
                    };
                    let payload = match it.next() {
                        Some(Reply::Bulk(Some(p))) => p,
                        other => return Err(protocol("subscribe", format!("bad payload: {other:?}"))),
                    };
                    return Ok(Consumed::Message { channel, payload });
                }
                // subscribe/unsubscribe confirmations
                _ => continue,
            }
        }
    }
}

fn host_port(uri: &str) -> Result<String> {
    let rest = uri
        .splitn(2, "://")
        .nth(1)
        .ok_or_else(|| protocol("connect", format!("bad registry uri: {uri}")))?;
    let authority = rest.split('/').next().unwrap_or(rest);
    if authority.rsplit_once(':').is_none() {
        return Err(protocol("connect", format!("registry uri missing port: {uri}")));
    }
    Ok(authority.to_string())
}

fn protocol(op: &'static str, detail: String) -> RegistryError {
    RegistryError::Protocol { op, detail }
}

fn encode_pipeline_command(command: &PipelineCommand) -> Vec<Vec<Vec<u8>>> {
    fn args(parts: &[&str]) -> Vec<Vec<u8>> {
        parts.iter().map(|p| p.as_bytes().to_vec()).collect()
    }
    match command {
        PipelineCommand::SetEx { key, value, ttl } => {
            vec![args(&["SETEX", key, &ttl.as_secs().max(1).to_string(), value])]
        }
        PipelineCommand::HSet { key, fields } => {
            let mut cmd = vec!["HSET".to_string(), key.clone()];
            for (f, v) in fields {
                cmd.push(f.clone());
                cmd.push(v.clone());
            }
            vec![cmd.into_iter().map(String::into_bytes).collect()]
        }
        PipelineCommand::Expire { key, ttl } => {
            vec![args(&["EXPIRE", key, &ttl.as_secs().max(1).to_string()])]
        }
        PipelineCommand::RPush { key, values } => {
            let mut cmd = vec!["RPUSH".to_string(), key.clone()];
            cmd.extend_from_slice(values);
            vec![cmd.into_iter().map(String::into_bytes).collect()]
        }
        PipelineCommand::Del { keys } => {
            let mut cmd = vec!["DEL".to_string()];
            cmd.extend_from_slice(keys);
            vec![cmd.into_iter().map(String::into_bytes).collect()]
        }
        PipelineCommand::HDel { key, fields } => {
            let mut cmd = vec!["HDEL".to_string(), key.clone()];
            cmd.extend_from_slice(fields);
            vec![cmd.into_iter().map(String::into_bytes).collect()]
        }
    }
}

async fn write_command(conn: &mut BufStream<TcpStream>, args: &[&[u8]]) -> Result<()> {
    let op = "write";
    let mut frame = Vec::with_capacity(32 + args.iter().map(|a| a.len() + 16).sum::<usize>());
    frame.extend_from_slice(format!("*{}\r\n", args.len()).as_bytes());
    for arg in args {
        frame.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        frame.extend_from_slice(arg);
        frame.extend_from_slice(b"\r\n");
    }
    conn.write_all(&frame).await.context(IoSnafu { op })?;
    Ok(())
}

/// Parse one reply frame. Boxed because array replies recurse.
fn read_reply<'a>(conn: &'a mut BufStream<TcpStream>, op: &'static str) -> BoxFuture<'a, Result<Reply>> {
    Box::pin(async move {
        let line = read_line(conn, op).await?;
        let (kind, rest) = line.split_at(1);
        match kind {
            "+" => Ok(Reply::Simple(rest.to_string())),
            "-" => Ok(Reply::Error(rest.to_string())),
            ":" => rest
                .parse()
                .map(Reply::Int)
                .map_err(|e| protocol(op, format!("bad integer reply: {e}"))),
            "$" => {
                let len: i64 = rest.parse().map_err(|e| protocol(op, format!("bad bulk length: {e}")))?;
                if len < 0 {
                    return Ok(Reply::Bulk(None));
                }
                let mut buf = vec![0u8; len as usize + 2];
                conn.read_exact(&mut buf).await.context(IoSnafu { op })?;
                buf.truncate(len as usize);
                String::from_utf8(buf)
                    .map(|s| Reply::Bulk(Some(s)))
                    .map_err(|e| protocol(op, format!("non-utf8 bulk reply: {e}")))
            }
            "*" => {
                let len: i64 = rest.parse().map_err(|e| protocol(op, format!("bad array length: {e}")))?;
                if len < 0 {
                    return Ok(Reply::Array(None));
                }
                let mut items = Vec::with_capacity(len as usize);
                for _ in 0..len {
                    items.push(read_reply(conn, op).await?);
                }
                Ok(Reply::Array(Some(items)))
            }
            other => Err(protocol(op, format!("unknown reply tag {other:?}"))),
        }
    })
}

async fn read_line(conn: &mut BufStream<TcpStream>, op: &'static str) -> Result<String> {
    let mut line = Vec::new();
    conn.read_until(b'\n', &mut line).await.context(IoSnafu { op })?;
    if !line.ends_with(b"\r\n") {
        return Err(protocol(op, "truncated reply line".into()));
    }
    line.truncate(line.len() - 2);
    if line.is_empty() {
        return Err(protocol(op, "empty reply line".into()));
    }
    String::from_utf8(line).map_err(|e| protocol(op, format!("non-utf8 reply line: {e}")))
}

fn expect_int(reply: Reply, op: &'static str) -> Result<i64> {
    match reply {
        Reply::Int(n) => Ok(n),
        other => Err(protocol(op, format!("expected integer reply, got {other:?}"))),
    }
}

fn expect_bulk(reply: Reply, op: &'static str) -> Result<Option<String>> {
    match reply {
        Reply::Bulk(b) => Ok(b),
        Reply::Simple(s) => Ok(Some(s)),
        other => Err(protocol(op, format!("expected bulk reply, got {other:?}"))),
    }
}

fn expect_array(reply: Reply, op: &'static str) -> Result<Vec<Reply>> {
    match reply {
        Reply::Array(Some(items)) => Ok(items),
        Reply::Array(None) => Ok(Vec::new()),
        other => Err(protocol(op, format!("expected array reply, got {other:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_port_extraction() {
        assert_eq!(host_port("tcp://127.0.0.1:6379/0").unwrap(), "127.0.0.1:6379");
        assert_eq!(host_port("redis://registry.local:7000").unwrap(), "registry.local:7000");
        assert!(host_port("tcp://nohost").is_err());
        assert!(host_port("6379").is_err());
    }

    #[test]
    fn pipeline_encoding_shapes() {
        let cmds = encode_pipeline_command(&PipelineCommand::SetEx {
            key: "k".into(),
            value: "v".into(),
            ttl: Duration::from_secs(5),
        });
        assert_eq!(cmds.len(), 1);
        assert_eq!(cmds[0][0], b"SETEX".to_vec());
        assert_eq!(cmds[0][2], b"5".to_vec());

        let cmds = encode_pipeline_command(&PipelineCommand::HSet {
            key: "h".into(),
            fields: vec![("f".into(), "v".into())],
        });
        assert_eq!(cmds[0], vec![b"HSET".to_vec(), b"h".to_vec(), b"f".to_vec(), b"v".to_vec()]);
    }

    #[tokio::test]
    async fn reply_parsing_over_loopback() {
        use tokio::io::AsyncWriteExt as _;
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(b"+OK\r\n:42\r\n$5\r\nhello\r\n$-1\r\n*2\r\n$1\r\na\r\n$1\r\nb\r\n-ERR boom\r\n")
                .await
                .unwrap();
        });
        let stream = TcpStream::connect(addr).await.unwrap();
        let mut conn = BufStream::new(stream);
        assert_eq!(read_reply(&mut conn, "t").await.unwrap(), Reply::Simple("OK".into()));
        assert_eq!(read_reply(&mut conn, "t").await.unwrap(), Reply::Int(42));
        assert_eq!(read_reply(&mut conn, "t").await.unwrap(), Reply::Bulk(Some("hello".into())));
        assert_eq!(read_reply(&mut conn, "t").await.unwrap(), Reply::Bulk(None));
        assert_eq!(
            read_reply(&mut conn, "t").await.unwrap(),
            Reply::Array(Some(vec![Reply::Bulk(Some("a".into())), Reply::Bulk(Some("b".into()))]))
        );
        assert_eq!(read_reply(&mut conn, "t").await.unwrap(), Reply::Error("ERR boom".into()));
    }

    #[tokio::test]
    async fn command_encoding_over_loopback() {
        use tokio::io::AsyncReadExt as _;
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 64];
            let n = sock.read(&mut buf).await.unwrap();
            buf.truncate(n);
            buf
        });
        let stream = TcpStream::connect(addr).await.unwrap();
        let mut conn = BufStream::new(stream);
        write_command(&mut conn, &[b"GET".as_ref(), b"key".as_ref()]).await.unwrap();
        conn.flush().await.unwrap();
        drop(conn);
        let seen = server.await.unwrap();
        assert_eq!(seen, b"*2\r\n$3\r\nGET\r\n$3\r\nkey\r\n".to_vec());
    }
}
