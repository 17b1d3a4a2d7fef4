use std::io;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{Capabilities, Cursor, PopReply, Store, TxOp, TxReply};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::resp::{Reply, RespLimits, append_command, encode_command, read_reply};

const COMPARE_AND_DELETE: &str =
    "if redis.call('get',KEYS[1])==ARGV[1] then return redis.call('del',KEYS[1]) else return 0 end";

const NATIVE_POP_SINCE: (u32, u32, u32) = (6, 2, 0);
const UNLINK_SINCE: (u32, u32, u32) = (4, 0, 0);

/// Pull `redis_version` out of an `INFO server` body.
fn parse_server_version(info: &str) -> Option<(u32, u32, u32)> {
    let raw = info
        .lines()
        .find_map(|line| line.trim_end().strip_prefix("redis_version:"))?;
    let mut parts = raw.split('.').map(|p| p.parse::<u32>().ok());
    let major = parts.next()??;
    let minor = parts.next().flatten().unwrap_or(0);
    let patch = parts.next().flatten().unwrap_or(0);
    Some((major, minor, patch))
}

fn negotiated_capabilities(version: Option<(u32, u32, u32)>) -> Capabilities {
    match version {
        None => Capabilities::NONE,
        Some(v) => Capabilities {
            native_pop_count: v >= NATIVE_POP_SINCE,
            unlink: v >= UNLINK_SINCE,
        },
    }
}

struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: BufWriter<OwnedWriteHalf>,
}

impl Connection {
    async fn open(addr: &str, timeout: Duration) -> Result<Self> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
        // Commands are small and latency bound.
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            reader: BufReader::with_capacity(64 * 1024, read_half),
            writer: BufWriter::with_capacity(64 * 1024, write_half),
        })
    }

    /// Write a pipelined batch with one flush and read `replies` replies back.
    async fn roundtrip(&mut self, wire: &[u8], replies: usize, limits: RespLimits) -> Result<Vec<Reply>> {
        self.writer.write_all(wire).await?;
        self.writer.flush().await?;
        let mut out = Vec::with_capacity(replies);
        for _ in 0..replies {
            match read_reply(&mut self.reader, limits).await? {
                Some(reply) => out.push(reply),
                None => {
                    return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed by store").into());
                }
            }
        }
        Ok(out)
    }
}

/// Store over a Redis-compatible server, one TCP connection per store.
pub struct RespStore {
    addr: String,
    strict: bool,
    connect_timeout: Duration,
    limits: RespLimits,
    caps: Capabilities,
    conn: Mutex<Option<Connection>>,
}

impl RespStore {
    /// Connect and settle [`Capabilities`] once: `INFO server` supplies the
    /// version, `Config::native_pop` / `Config::unlink` may override it.
    pub async fn connect(config: &Config) -> Result<Self> {
        let addr = config.addr();
        let limits = config.resp_limits();
        let mut conn = Connection::open(&addr, config.connect_timeout()).await?;

        let mut replies = conn.roundtrip(&encode_command(&[b"INFO", b"server"]), 1, limits).await?;
        let version = match replies.pop().map(Reply::into_string) {
            Some(Ok(info)) => parse_server_version(&info),
            Some(Err(e)) if !e.is_connectivity() => {
                warn!(addr = %addr, error = %e, "INFO rejected, assuming no optional commands");
                None
            }
            Some(Err(e)) => return Err(e),
            None => None,
        };
        let negotiated = negotiated_capabilities(version);
        let caps = Capabilities {
            native_pop_count: config.native_pop.resolve(negotiated.native_pop_count),
            unlink: config.unlink.resolve(negotiated.unlink),
        };
        info!(
            addr = %addr,
            version = ?version,
            native_pop_count = caps.native_pop_count,
            unlink = caps.unlink,
            "connected to store"
        );

        Ok(Self {
            addr,
            strict: config.strict_connection,
            connect_timeout: config.connect_timeout(),
            limits,
            caps,
            conn: Mutex::new(Some(conn)),
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Send pre-encoded commands as one pipeline. The connection guard is
    /// held for the whole batch, so a `MULTI .. EXEC` never interleaves with
    /// another caller.
    ///
    /// The connection is out of its slot while replies are pending and only
    /// goes back once every reply has been read. A failed or cancelled round
    /// trip therefore drops it, and no later caller can read a stale reply.
    async fn pipeline(&self, wire: &[u8], replies: usize) -> Result<Vec<Reply>> {
        let mut guard = self.conn.lock().await;
        let mut conn = match guard.take() {
            Some(conn) => conn,
            None if self.strict => return Err(Error::NotConnected { addr: self.addr.clone() }),
            None => {
                debug!(addr = %self.addr, "reconnecting");
                Connection::open(&self.addr, self.connect_timeout).await?
            }
        };
        match conn.roundtrip(wire, replies, self.limits).await {
            Ok(out) => {
                *guard = Some(conn);
                Ok(out)
            }
            Err(e) => {
                if self.strict {
                    warn!(addr = %self.addr, error = %e, "connection lost in strict mode");
                } else {
                    debug!(addr = %self.addr, error = %e, "connection dropped");
                }
                Err(e)
            }
        }
    }

    async fn call(&self, args: &[&[u8]]) -> Result<Reply> {
        self.pipeline(&encode_command(args), 1)
            .await?
            .pop()
            .ok_or_else(|| Error::Protocol("missing reply".to_owned()))
    }

    async fn call_keys(&self, command: &[u8], keys: &[String]) -> Result<Reply> {
        let mut args: Vec<&[u8]> = Vec::with_capacity(keys.len() + 1);
        args.push(command);
        args.extend(keys.iter().map(|k| k.as_bytes()));
        self.call(&args).await
    }
}

fn key_string(bytes: Vec<u8>) -> Result<String> {
    String::from_utf8(bytes).map_err(|_| Error::Protocol("key is not UTF-8".to_owned()))
}

fn append_op(out: &mut Vec<u8>, op: &TxOp) {
    match op {
        TxOp::Get { key } => append_command(out, &[b"GET", key.as_bytes()]),
        TxOp::LRange { key, start, stop } => {
            let (start, stop) = (start.to_string(), stop.to_string());
            append_command(out, &[b"LRANGE", key.as_bytes(), start.as_bytes(), stop.as_bytes()]);
        }
        TxOp::LTrim { key, start, stop } => {
            let (start, stop) = (start.to_string(), stop.to_string());
            append_command(out, &[b"LTRIM", key.as_bytes(), start.as_bytes(), stop.as_bytes()]);
        }
        TxOp::RPush { key, values } => {
            let mut args: Vec<&[u8]> = vec![b"RPUSH".as_slice(), key.as_bytes()];
            args.extend(values.iter().map(Vec::as_slice));
            append_command(out, &args);
        }
        TxOp::Del { keys } => {
            let mut args: Vec<&[u8]> = vec![b"DEL".as_slice()];
            args.extend(keys.iter().map(|k| k.as_bytes()));
            append_command(out, &args);
        }
    }
}

fn tx_reply(op: &TxOp, reply: Reply) -> Result<TxReply> {
    match op {
        TxOp::Get { .. } => reply.into_bulk().map(TxReply::Value),
        TxOp::LRange { .. } => reply.into_bulk_array().map(TxReply::Values),
        TxOp::LTrim { .. } => reply.into_ok().map(|()| TxReply::Ok),
        TxOp::RPush { .. } | TxOp::Del { .. } => reply.into_integer().map(TxReply::Integer),
    }
}

#[async_trait]
impl Store for RespStore {
    fn capabilities(&self) -> Capabilities {
        self.caps
    }

    async fn ping(&self) -> Result<()> {
        self.call(&[b"PING"]).await?.into_ok()
    }

    async fn scan(&self, cursor: &Cursor, pattern: &str, page_hint: usize) -> Result<(Cursor, Vec<String>)> {
        let hint = page_hint.to_string();
        let reply = self
            .call(&[
                b"SCAN",
                cursor.as_str().as_bytes(),
                b"MATCH",
                pattern.as_bytes(),
                b"COUNT",
                hint.as_bytes(),
            ])
            .await?;
        let mut parts = reply.into_array()?.into_iter();
        let (Some(next), Some(keys), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(Error::Protocol("SCAN reply is not [cursor, keys]".to_owned()));
        };
        let next = Cursor::new(next.into_string()?);
        let keys = keys
            .into_bulk_array()?
            .into_iter()
            .map(key_string)
            .collect::<Result<Vec<_>>>()?;
        debug!(cursor = %cursor, next = %next, pattern, found = keys.len(), "SCAN");
        Ok((next, keys))
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.call(&[b"GET", key.as_bytes()]).await?.into_bulk()
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let values = self
            .call_keys(b"MGET", keys)
            .await?
            .into_array()?
            .into_iter()
            .map(Reply::into_bulk)
            .collect::<Result<Vec<_>>>()?;
        if values.len() != keys.len() {
            return Err(Error::Protocol(format!(
                "MGET returned {} values for {} keys",
                values.len(),
                keys.len()
            )));
        }
        Ok(values)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()> {
        debug!(key = %key, ttl = ?ttl, "SET");
        let reply = match ttl {
            None => self.call(&[b"SET", key.as_bytes(), value]).await?,
            Some(ttl) => {
                let ms = ttl.as_millis().max(1).to_string();
                self.call(&[b"SET", key.as_bytes(), value, b"PX", ms.as_bytes()]).await?
            }
        };
        reply.into_ok()
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let ms = ttl.as_millis().max(1).to_string();
        Ok(self.call(&[b"PEXPIRE", key.as_bytes(), ms.as_bytes()]).await?.into_integer()? == 1)
    }

    async fn llen(&self, key: &str) -> Result<u64> {
        self.call(&[b"LLEN", key.as_bytes()]).await?.into_u64()
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<Vec<u8>>> {
        let (start, stop) = (start.to_string(), stop.to_string());
        self.call(&[b"LRANGE", key.as_bytes(), start.as_bytes(), stop.as_bytes()])
            .await?
            .into_bulk_array()
    }

    async fn rpush(&self, key: &str, values: &[Vec<u8>]) -> Result<u64> {
        if values.is_empty() {
            return self.llen(key).await;
        }
        let mut args: Vec<&[u8]> = Vec::with_capacity(values.len() + 2);
        args.push(b"RPUSH");
        args.push(key.as_bytes());
        args.extend(values.iter().map(Vec::as_slice));
        self.call(&args).await?.into_u64()
    }

    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> Result<()> {
        let (start, stop) = (start.to_string(), stop.to_string());
        self.call(&[b"LTRIM", key.as_bytes(), start.as_bytes(), stop.as_bytes()])
            .await?
            .into_ok()
    }

    async fn pop_count_native(&self, key: &str, count: usize) -> Result<PopReply> {
        let n = count.to_string();
        match self.call(&[b"LPOP", key.as_bytes(), n.as_bytes()]).await?.into_result()? {
            Reply::Nil => Ok(PopReply::Nil),
            Reply::Bulk(item) => Ok(PopReply::Single(item)),
            reply @ Reply::Array(_) => Ok(PopReply::Many(reply.into_bulk_array()?)),
            other => Err(Error::Protocol(format!("unexpected LPOP reply {other:?}"))),
        }
    }

    async fn del(&self, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        self.call_keys(b"DEL", keys).await?.into_u64()
    }

    async fn unlink(&self, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        self.call_keys(b"UNLINK", keys).await?.into_u64()
    }

    async fn set_if_absent_with_expiry(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
        let ms = ttl.as_millis().max(1).to_string();
        let reply = self
            .call(&[b"SET", key.as_bytes(), value, b"NX", b"PX", ms.as_bytes()])
            .await?
            .into_result()?;
        match reply {
            Reply::Nil => Ok(false),
            Reply::Simple(_) => Ok(true),
            other => Err(Error::Protocol(format!("unexpected SET NX reply {other:?}"))),
        }
    }

    async fn transaction(&self, ops: &[TxOp]) -> Result<Vec<TxReply>> {
        if ops.is_empty() {
            return Ok(Vec::new());
        }
        let mut wire = encode_command(&[b"MULTI"]);
        for op in ops {
            append_op(&mut wire, op);
        }
        append_command(&mut wire, &[b"EXEC"]);

        let mut replies = self.pipeline(&wire, ops.len() + 2).await?.into_iter();
        let missing = || Error::Protocol("transaction reply truncated".to_owned());
        replies.next().ok_or_else(missing)?.into_ok()?;
        // A command rejected while queueing makes EXEC fail with EXECABORT;
        // report the rejection itself.
        let mut queue_err = None;
        for _ in ops {
            if let Reply::Error(line) = replies.next().ok_or_else(missing)? {
                queue_err.get_or_insert(Error::from_reply(&line));
            }
        }
        let items = match replies.next().ok_or_else(missing)? {
            Reply::Nil => return Err(Error::TransactionAborted),
            Reply::Error(line) => return Err(queue_err.unwrap_or_else(|| Error::from_reply(&line))),
            exec => exec.into_array()?,
        };
        if items.len() != ops.len() {
            return Err(Error::Protocol(format!(
                "EXEC returned {} replies for {} ops",
                items.len(),
                ops.len()
            )));
        }
        ops.iter().zip(items).map(|(op, reply)| tx_reply(op, reply)).collect()
    }

    async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> Result<bool> {
        let deleted = self
            .call(&[b"EVAL", COMPARE_AND_DELETE.as_bytes(), b"1", key.as_bytes(), expected])
            .await?
            .into_integer()?;
        Ok(deleted == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CapabilityMode;
    use crate::resp::read_command;
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    type Script = Vec<(Vec<&'static str>, String)>;

    fn bulk(s: &str) -> String {
        format!("${}\r\n{s}\r\n", s.len())
    }

    fn info(version: &str) -> String {
        bulk(&format!("# Server\r\nredis_version:{version}\r\nredis_mode:standalone\r\n"))
    }

    /// Serve one script per accepted connection: check each command, send the
    /// canned reply, then close. Returns every command received.
    async fn scripted_peer(connections: Vec<Script>) -> (u16, JoinHandle<Vec<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let mut received = Vec::new();
            for script in connections {
                let (stream, _) = listener.accept().await.unwrap();
                let (read_half, mut write_half) = stream.into_split();
                let mut reader = tokio::io::BufReader::new(read_half);
                for (expected, reply) in script {
                    let cmd = read_command(&mut reader).await.unwrap().unwrap();
                    let cmd: Vec<String> = cmd.into_iter().map(|a| String::from_utf8(a).unwrap()).collect();
                    assert_eq!(cmd, expected);
                    received.push(cmd);
                    write_half.write_all(reply.as_bytes()).await.unwrap();
                }
            }
            received
        });
        (port, handle)
    }

    fn config(port: u16) -> Config {
        Config { port, ..Config::default() }
    }

    fn handshake(version: &str) -> (Vec<&'static str>, String) {
        (vec!["INFO", "server"], info(version))
    }

    #[test]
    fn parses_server_version() {
        assert_eq!(parse_server_version("# Server\r\nredis_version:7.2.4\r\n"), Some((7, 2, 4)));
        assert_eq!(parse_server_version("redis_version:6.2\n"), Some((6, 2, 0)));
        assert_eq!(parse_server_version("redis_mode:standalone\r\n"), None);
        assert_eq!(parse_server_version("redis_version:abc\r\n"), None);
    }

    #[test]
    fn capability_thresholds() {
        assert_eq!(negotiated_capabilities(Some((7, 0, 0))), Capabilities::ALL);
        assert_eq!(negotiated_capabilities(Some((6, 2, 0))), Capabilities::ALL);
        assert_eq!(
            negotiated_capabilities(Some((6, 0, 16))),
            Capabilities { native_pop_count: false, unlink: true }
        );
        assert_eq!(negotiated_capabilities(Some((3, 2, 12))), Capabilities::NONE);
        assert_eq!(negotiated_capabilities(None), Capabilities::NONE);
    }

    #[tokio::test]
    async fn connect_negotiates_from_server_version() {
        let (port, peer) = scripted_peer(vec![vec![handshake("5.0.7")]]).await;
        let store = RespStore::connect(&config(port)).await.unwrap();
        assert_eq!(store.capabilities(), Capabilities { native_pop_count: false, unlink: true });
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn config_overrides_negotiation() {
        let (port, peer) = scripted_peer(vec![vec![handshake("7.2.4")]]).await;
        let cfg = Config { native_pop: CapabilityMode::Off, ..config(port) };
        let store = RespStore::connect(&cfg).await.unwrap();
        assert_eq!(store.capabilities(), Capabilities { native_pop_count: false, unlink: true });
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn rejected_info_means_no_optional_commands() {
        let (port, peer) =
            scripted_peer(vec![vec![(vec!["INFO", "server"], "-ERR unknown command 'INFO'\r\n".into())]]).await;
        let store = RespStore::connect(&config(port)).await.unwrap();
        assert_eq!(store.capabilities(), Capabilities::NONE);
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn scan_sends_match_and_count() {
        let (port, peer) = scripted_peer(vec![vec![
            handshake("7.2.4"),
            (
                vec!["SCAN", "0", "MATCH", "job:*", "COUNT", "50"],
                format!("*2\r\n{}*2\r\n{}{}", bulk("1792"), bulk("job:1"), bulk("job:2")),
            ),
            (
                vec!["SCAN", "1792", "MATCH", "job:*", "COUNT", "50"],
                format!("*2\r\n{}*0\r\n", bulk("0")),
            ),
        ]])
        .await;
        let store = RespStore::connect(&config(port)).await.unwrap();
        let (next, keys) = store.scan(&Cursor::START, "job:*", 50).await.unwrap();
        assert_eq!(next.as_str(), "1792");
        assert_eq!(keys, vec!["job:1", "job:2"]);
        let (next, keys) = store.scan(&next, "job:*", 50).await.unwrap();
        assert!(next.is_start());
        assert!(keys.is_empty());
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn mget_keeps_nil_slots() {
        let (port, peer) = scripted_peer(vec![vec![
            handshake("7.2.4"),
            (vec!["MGET", "a", "b", "c"], format!("*3\r\n{}$-1\r\n$0\r\n\r\n", bulk("1"))),
        ]])
        .await;
        let store = RespStore::connect(&config(port)).await.unwrap();
        let keys = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        assert_eq!(
            store.mget(&keys).await.unwrap(),
            vec![Some(b"1".to_vec()), None, Some(Vec::new())]
        );
        assert!(store.mget(&[]).await.unwrap().is_empty());
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn lpop_count_reply_shapes() {
        let (port, peer) = scripted_peer(vec![vec![
            handshake("7.2.4"),
            (vec!["LPOP", "q", "2"], format!("*2\r\n{}{}", bulk("a"), bulk("b"))),
            (vec!["LPOP", "q", "2"], bulk("c")),
            (vec!["LPOP", "q", "2"], "*-1\r\n".into()),
            (vec!["LPOP", "q", "2"], "-ERR wrong number of arguments for 'lpop' command\r\n".into()),
        ]])
        .await;
        let store = RespStore::connect(&config(port)).await.unwrap();
        assert_eq!(
            store.pop_count_native("q", 2).await.unwrap(),
            PopReply::Many(vec![b"a".to_vec(), b"b".to_vec()])
        );
        assert_eq!(store.pop_count_native("q", 2).await.unwrap(), PopReply::Single(b"c".to_vec()));
        assert_eq!(store.pop_count_native("q", 2).await.unwrap(), PopReply::Nil);
        assert!(matches!(store.pop_count_native("q", 2).await, Err(Error::Server(_))));
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn set_nx_px_reports_outcome() {
        let (port, peer) = scripted_peer(vec![vec![
            handshake("7.2.4"),
            (vec!["SET", "lock", "t1", "NX", "PX", "2000"], "+OK\r\n".into()),
            (vec!["SET", "lock", "t2", "NX", "PX", "2000"], "$-1\r\n".into()),
        ]])
        .await;
        let store = RespStore::connect(&config(port)).await.unwrap();
        let ttl = Duration::from_millis(2000);
        assert!(store.set_if_absent_with_expiry("lock", b"t1", ttl).await.unwrap());
        assert!(!store.set_if_absent_with_expiry("lock", b"t2", ttl).await.unwrap());
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn compare_and_delete_uses_eval() {
        let (port, peer) = scripted_peer(vec![vec![
            handshake("7.2.4"),
            (vec!["EVAL", COMPARE_AND_DELETE, "1", "lock", "tok"], ":1\r\n".into()),
            (vec!["EVAL", COMPARE_AND_DELETE, "1", "lock", "tok"], ":0\r\n".into()),
        ]])
        .await;
        let store = RespStore::connect(&config(port)).await.unwrap();
        assert!(store.compare_and_delete("lock", b"tok").await.unwrap());
        assert!(!store.compare_and_delete("lock", b"tok").await.unwrap());
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn transaction_pipelines_multi_exec() {
        let (port, peer) = scripted_peer(vec![vec![
            handshake("5.0.7"),
            (vec!["MULTI"], "+OK\r\n".into()),
            (vec!["LRANGE", "q", "0", "3"], "+QUEUED\r\n".into()),
            (vec!["LTRIM", "q", "4", "-1"], "+QUEUED\r\n".into()),
            (vec!["EXEC"], format!("*2\r\n*2\r\n{}{}+OK\r\n", bulk("a"), bulk("b"))),
        ]])
        .await;
        let store = RespStore::connect(&config(port)).await.unwrap();
        let replies = store
            .transaction(&[
                TxOp::LRange { key: "q".into(), start: 0, stop: 3 },
                TxOp::LTrim { key: "q".into(), start: 4, stop: -1 },
            ])
            .await
            .unwrap();
        assert_eq!(
            replies,
            vec![TxReply::Values(vec![b"a".to_vec(), b"b".to_vec()]), TxReply::Ok]
        );
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn nil_exec_is_aborted() {
        let (port, peer) = scripted_peer(vec![vec![
            handshake("7.2.4"),
            (vec!["MULTI"], "+OK\r\n".into()),
            (vec!["GET", "k"], "+QUEUED\r\n".into()),
            (vec!["EXEC"], "*-1\r\n".into()),
        ]])
        .await;
        let store = RespStore::connect(&config(port)).await.unwrap();
        let err = store.transaction(&[TxOp::Get { key: "k".into() }]).await.unwrap_err();
        assert!(matches!(err, Error::TransactionAborted));
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn queue_rejection_is_reported_over_execabort() {
        let (port, peer) = scripted_peer(vec![vec![
            handshake("7.2.4"),
            (vec!["MULTI"], "+OK\r\n".into()),
            (vec!["GET", "k"], "-ERR unknown command\r\n".into()),
            (
                vec!["EXEC"],
                "-EXECABORT Transaction discarded because of previous errors.\r\n".into(),
            ),
        ]])
        .await;
        let store = RespStore::connect(&config(port)).await.unwrap();
        let err = store.transaction(&[TxOp::Get { key: "k".into() }]).await.unwrap_err();
        assert!(matches!(err, Error::Server(ref m) if m == "ERR unknown command"));
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn strict_mode_refuses_to_reconnect() {
        let (port, peer) = scripted_peer(vec![vec![handshake("7.2.4")]]).await;
        let cfg = Config { strict_connection: true, ..config(port) };
        let store = RespStore::connect(&cfg).await.unwrap();
        peer.await.unwrap();

        let first = store.get("k").await.unwrap_err();
        assert!(first.is_connectivity());
        let second = store.get("k").await.unwrap_err();
        assert!(matches!(second, Error::NotConnected { .. }));
    }

    #[tokio::test]
    async fn lenient_mode_reconnects_on_next_call() {
        let (port, peer) = scripted_peer(vec![
            vec![handshake("7.2.4")],
            vec![(vec!["GET", "k"], bulk("v"))],
        ])
        .await;
        let store = RespStore::connect(&config(port)).await.unwrap();

        assert!(store.get("k").await.unwrap_err().is_connectivity());
        assert_eq!(store.get("k").await.unwrap(), Some(b"v".to_vec()));
        assert_eq!(store.addr(), format!("127.0.0.1:{port}"));
        let received = peer.await.unwrap();
        assert_eq!(received.len(), 2);
    }

    /// Answer the handshake, then hold the reply to the first command for
    /// `delay` before writing `late_reply`. Later connections are served
    /// from `then`.
    async fn slow_peer(
        delay: Duration,
        late_reply: &'static str,
        then: Vec<Script>,
    ) -> (u16, JoinHandle<Vec<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut reader = tokio::io::BufReader::new(read_half);
            read_command(&mut reader).await.unwrap().unwrap();
            write_half.write_all(info("7.2.4").as_bytes()).await.unwrap();
            let slow = read_command(&mut reader).await.unwrap().unwrap();
            let mut received: Vec<Vec<String>> = vec![slow.into_iter().map(|a| String::from_utf8(a).unwrap()).collect()];
            tokio::time::sleep(delay).await;
            // The client may already have hung up.
            let _ = write_half.write_all(late_reply.as_bytes()).await;

            for script in then {
                let (stream, _) = listener.accept().await.unwrap();
                let (read_half, mut write_half) = stream.into_split();
                let mut reader = tokio::io::BufReader::new(read_half);
                for (expected, reply) in script {
                    let cmd = read_command(&mut reader).await.unwrap().unwrap();
                    let cmd: Vec<String> = cmd.into_iter().map(|a| String::from_utf8(a).unwrap()).collect();
                    assert_eq!(cmd, expected);
                    received.push(cmd);
                    write_half.write_all(reply.as_bytes()).await.unwrap();
                }
            }
            received
        });
        (port, handle)
    }

    #[tokio::test]
    async fn cancelled_call_never_leaks_its_reply() {
        let (port, peer) = slow_peer(
            Duration::from_millis(200),
            "$1\r\nA\r\n",
            vec![vec![(vec!["GET", "b"], bulk("B"))]],
        )
        .await;
        let store = RespStore::connect(&config(port)).await.unwrap();

        let timed_out = tokio::time::timeout(Duration::from_millis(50), store.get("a")).await;
        assert!(timed_out.is_err());
        tokio::time::sleep(Duration::from_millis(250)).await;

        assert_eq!(store.get("b").await.unwrap(), Some(b"B".to_vec()));
        let received = peer.await.unwrap();
        assert_eq!(received, vec![vec!["GET", "a"], vec!["GET", "b"]]);
    }

    #[tokio::test]
    async fn cancelled_transaction_is_not_reused() {
        let (port, peer) = slow_peer(
            Duration::from_millis(200),
            "+OK\r\n+QUEUED\r\n*1\r\n$1\r\nv\r\n",
            vec![vec![(vec!["GET", "k"], bulk("fresh"))]],
        )
        .await;
        let store = RespStore::connect(&config(port)).await.unwrap();

        let ops = [TxOp::Get { key: "k".into() }];
        assert!(tokio::time::timeout(Duration::from_millis(50), store.transaction(&ops)).await.is_err());
        assert_eq!(store.get("k").await.unwrap(), Some(b"fresh".to_vec()));
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn strict_mode_treats_cancellation_as_lost_connection() {
        let (port, peer) = slow_peer(Duration::from_millis(200), "$1\r\nA\r\n", Vec::new()).await;
        let cfg = Config { strict_connection: true, ..config(port) };
        let store = RespStore::connect(&cfg).await.unwrap();

        assert!(tokio::time::timeout(Duration::from_millis(50), store.get("a")).await.is_err());
        assert!(matches!(store.get("b").await, Err(Error::NotConnected { .. })));
        peer.await.unwrap();
    }
}
