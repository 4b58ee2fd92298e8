//! Wire-level tests against a live server: literal request bytes in,
//! literal response bytes out.

use std::collections::BTreeMap;
use std::sync::Arc;

use pipeline::{CommandTable, PipelineShared};
use rocks::StoreManager;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

struct TestServer {
    _dir: tempfile::TempDir,
    addr: std::net::SocketAddr,
    shutdown: CancellationToken,
}

impl TestServer {
    async fn start() -> TestServer {
        let dir = tempfile::TempDir::new().unwrap();
        let mut opts = rocks::rocksdb::Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        let names = vec![
            rocks::DEFAULT_COLUMN_FAMILY.to_string(),
            rocks::METADATA_COLUMN_FAMILY.to_string(),
        ];
        let db = rocks::rocksdb::DB::open_cf(&opts, dir.path(), names.iter()).unwrap();
        let store = Arc::new(StoreManager::new(
            db,
            dir.path(),
            names,
            BTreeMap::new(),
            false,
        ));

        let shared = Arc::new(PipelineShared::new("key-value", "0.0.0", store));
        let mut table = CommandTable::new();
        key_value::register_commands(&mut table);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        tokio::spawn(pipeline::listen(
            listener,
            shared,
            Arc::new(table),
            shutdown.clone(),
        ));

        TestServer {
            _dir: dir,
            addr,
            shutdown,
        }
    }

    async fn connect(&self) -> TcpStream {
        TcpStream::connect(self.addr).await.unwrap()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn exchange(conn: &mut TcpStream, request: &[u8], expected: &[u8]) {
    conn.write_all(request).await.unwrap();
    let mut response = vec![0u8; expected.len()];
    conn.read_exact(&mut response).await.unwrap();
    assert_eq!(
        response,
        expected,
        "got {:?}, want {:?}",
        String::from_utf8_lossy(&response),
        String::from_utf8_lossy(expected)
    );
}

#[tokio::test]
async fn ping_pongs() {
    let server = TestServer::start().await;
    let mut conn = server.connect().await;
    exchange(&mut conn, b"*1\r\n$4\r\nping\r\n", b"+PONG\r\n").await;
}

#[tokio::test]
async fn unknown_commands_report_their_name() {
    let server = TestServer::start().await;
    let mut conn = server.connect().await;
    exchange(&mut conn, b"*1\r\n$3\r\nfoo\r\n", b"-Unknown command: 'foo'\r\n").await;
}

#[tokio::test]
async fn malformed_array_length_keeps_the_connection_alive() {
    let server = TestServer::start().await;
    let mut conn = server.connect().await;
    exchange(
        &mut conn,
        b"*a\r\n",
        b"-Protocol Error: Invalid Array length\r\n",
    )
    .await;
    // All four bytes were consumed; the connection still serves requests.
    exchange(&mut conn, b"*1\r\n$4\r\nping\r\n", b"+PONG\r\n").await;
}

#[tokio::test]
async fn requests_resume_after_a_split() {
    let server = TestServer::start().await;
    let mut conn = server.connect().await;

    conn.write_all(b"*2\r\n$3\r\nge").await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(30)).await;
    // Completing the request yields GET of an absent key.
    exchange(&mut conn, b"t\r\n$2\r\nab\r\n", b"$-1\r\n").await;
}

#[tokio::test]
async fn set_then_get_roundtrips() {
    let server = TestServer::start().await;
    let mut conn = server.connect().await;

    exchange(
        &mut conn,
        b"*3\r\n$3\r\nset\r\n$2\r\nab\r\n$5\r\nhello\r\n",
        b"+OK\r\n",
    )
    .await;
    exchange(&mut conn, b"*2\r\n$3\r\nget\r\n$2\r\nab\r\n", b"$5\r\nhello\r\n").await;
}

#[tokio::test]
async fn discarded_transactions_leave_no_trace() {
    let server = TestServer::start().await;
    let mut conn = server.connect().await;

    exchange(&mut conn, b"*1\r\n$5\r\nmulti\r\n", b"+OK\r\n").await;
    exchange(
        &mut conn,
        b"*3\r\n$7\r\nsetmeta\r\n$1\r\nk\r\n$1\r\nv\r\n",
        b"+QUEUED\r\n",
    )
    .await;
    // Wrong arity poisons the transaction without queueing.
    exchange(
        &mut conn,
        b"*1\r\n$7\r\ngetmeta\r\n",
        b"-Wrong number of arguments for 'getmeta' command\r\n",
    )
    .await;
    exchange(
        &mut conn,
        b"*1\r\n$4\r\nexec\r\n",
        b"-Transaction discarded because of previous errors\r\n",
    )
    .await;
    // The queued setmeta must not have executed.
    exchange(&mut conn, b"*2\r\n$7\r\ngetmeta\r\n$1\r\nk\r\n", b"$-1\r\n").await;
}

#[tokio::test]
async fn committed_transactions_apply_atomically() {
    let server = TestServer::start().await;
    let mut conn = server.connect().await;

    exchange(&mut conn, b"*1\r\n$5\r\nmulti\r\n", b"+OK\r\n").await;
    exchange(
        &mut conn,
        b"*3\r\n$7\r\nsetmeta\r\n$1\r\na\r\n$1\r\n1\r\n",
        b"+QUEUED\r\n",
    )
    .await;
    exchange(
        &mut conn,
        b"*3\r\n$7\r\nsetmeta\r\n$1\r\nb\r\n$1\r\n2\r\n",
        b"+QUEUED\r\n",
    )
    .await;
    exchange(&mut conn, b"*1\r\n$4\r\nexec\r\n", b"*2\r\n+OK\r\n+OK\r\n").await;
    exchange(&mut conn, b"*2\r\n$7\r\ngetmeta\r\n$1\r\na\r\n", b"$1\r\n1\r\n").await;
    exchange(&mut conn, b"*2\r\n$7\r\ngetmeta\r\n$1\r\nb\r\n", b"$1\r\n2\r\n").await;
}

#[tokio::test]
async fn pipelined_commands_answer_in_request_order() {
    let server = TestServer::start().await;
    let mut conn = server.connect().await;

    conn.write_all(
        b"*3\r\n$3\r\nset\r\n$1\r\nk\r\n$1\r\nv\r\n*2\r\n$3\r\nget\r\n$1\r\nk\r\n*1\r\n$4\r\nping\r\n",
    )
    .await
    .unwrap();

    let expected = b"+OK\r\n$1\r\nv\r\n+PONG\r\n";
    let mut response = vec![0u8; expected.len()];
    conn.read_exact(&mut response).await.unwrap();
    assert_eq!(response, expected);
}

#[tokio::test]
async fn monitor_mirrors_other_connections() {
    let server = TestServer::start().await;
    let mut watcher = server.connect().await;
    let mut worker = server.connect().await;

    exchange(&mut watcher, b"*1\r\n$7\r\nmonitor\r\n", b"+OK\r\n").await;
    exchange(
        &mut worker,
        b"*3\r\n$3\r\nset\r\n$1\r\nk\r\n$1\r\nv\r\n",
        b"+OK\r\n",
    )
    .await;

    let mut buf = vec![0u8; 512];
    let n = watcher.read(&mut buf).await.unwrap();
    let line = String::from_utf8_lossy(&buf[..n]).into_owned();
    assert!(line.starts_with('+'), "line: {line}");
    assert!(line.contains("\"set\" \"k\" \"v\""), "line: {line}");
}

#[tokio::test]
async fn closing_connections_receive_goaway() {
    let server = TestServer::start().await;
    let mut conn = server.connect().await;

    exchange(&mut conn, b"*1\r\n$4\r\nping\r\n", b"+PONG\r\n").await;
    conn.shutdown().await.unwrap();

    let mut buf = Vec::new();
    conn.read_to_end(&mut buf).await.unwrap();
    assert_eq!(buf, b"-GOAWAY\r\n");
}
