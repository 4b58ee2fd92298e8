use std::sync::Arc;

use bytes::BytesMut;
use codec::{Decoded, Frame, RespValue, UNSOLICITED_KEY};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{CommandTable, Dispatcher, HandlerContext, OrderedReplies, PipelineShared};

/// Accept and serve connections until `shutdown` fires.
pub async fn listen(
    listener: TcpListener,
    shared: Arc<PipelineShared>,
    table: Arc<CommandTable>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (socket, addr) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        tracing::warn!(%err, "accept failed");
                        continue;
                    }
                };
                let _ = socket.set_nodelay(true);
                let shared = shared.clone();
                let table = table.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    if let Err(err) = serve(socket, addr.to_string(), shared, table, shutdown).await
                    {
                        tracing::info!(%err, peer = %addr, "connection closed with error");
                    }
                });
            }
            _ = shutdown.cancelled() => break,
        }
    }
}

/// Serve one connection: decode requests, dispatch them, and write replies
/// in request order. Async handlers resolve through the connection's reply
/// channel, which this task drains; nothing else ever writes the socket.
#[tracing::instrument(level = "debug", skip(socket, shared, table, shutdown), fields(%peer))]
pub async fn serve<S>(
    socket: S,
    peer: String,
    shared: Arc<PipelineShared>,
    table: Arc<CommandTable>,
    shutdown: CancellationToken,
) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let conn_id = shared.connection_opened();
    metrics::gauge!("pipeline_connections").increment(1.0);
    tracing::debug!(conn_id, "accepted client connection");

    let (mut reader, mut writer) = tokio::io::split(socket);
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<Frame>();
    let ctx = HandlerContext::new(shared.clone(), peer, conn_id, reply_tx);
    let mut dispatcher = Dispatcher::new(table);
    let mut replies = OrderedReplies::new();
    let mut inbound = BytesMut::with_capacity(8 * 1024);
    let mut outbound = BytesMut::new();

    let result = loop {
        tokio::select! {
            read = reader.read_buf(&mut inbound) => {
                match read {
                    Ok(0) => break Ok(()),
                    Ok(_) => {
                        loop {
                            match codec::decode(&mut inbound) {
                                Decoded::NeedMore(_) => break,
                                Decoded::Value(value) => {
                                    let key = replies.begin_request();
                                    dispatcher.dispatch(key, value, &ctx);
                                }
                            }
                        }
                        // Sync replies are already queued; release whatever
                        // is ready in order.
                        while let Ok(frame) = reply_rx.try_recv() {
                            handle_frame(frame, &mut replies, &mut outbound);
                        }
                        if let Err(err) = flush(&mut writer, &mut outbound).await {
                            break Err(err);
                        }
                    }
                    Err(err) => break Err(err),
                }
            }
            frame = reply_rx.recv() => {
                // The context holds a sender, so the channel cannot close
                // while this loop runs.
                let frame = frame.expect("the reply channel outlives the connection");
                handle_frame(frame, &mut replies, &mut outbound);
                while let Ok(frame) = reply_rx.try_recv() {
                    handle_frame(frame, &mut replies, &mut outbound);
                }
                if let Err(err) = flush(&mut writer, &mut outbound).await {
                    break Err(err);
                }
            }
            _ = shutdown.cancelled() => break Ok(()),
        }
    };

    // Tell the client we are going, whatever the reason for closing.
    tracing::debug!(conn_id, "connection closing");
    outbound.clear();
    RespValue::go_away().encode_into(&mut outbound);
    let _ = writer.write_all(&outbound).await;
    let _ = writer.shutdown().await;

    shared.remove_monitor(conn_id);
    shared.connection_closed();
    metrics::gauge!("pipeline_connections").decrement(1.0);
    result
}

fn handle_frame(frame: Frame, replies: &mut OrderedReplies, out: &mut BytesMut) {
    if frame.key == UNSOLICITED_KEY {
        frame.value.encode_into(out);
    } else {
        replies.resolve(frame.key, frame.value, |value| value.encode_into(out));
    }
}

async fn flush<W>(writer: &mut W, out: &mut BytesMut) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if out.is_empty() {
        return Ok(());
    }
    writer.write_all(out).await?;
    out.clear();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::build_shared;
    use crate::Command;
    use tokio::io::duplex;

    fn spawn_server(
        shared: Arc<PipelineShared>,
        table: CommandTable,
    ) -> (
        tokio::io::DuplexStream,
        tokio::task::JoinHandle<std::io::Result<()>>,
        CancellationToken,
    ) {
        let (client, server) = duplex(64 * 1024);
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(serve(
            server,
            "127.0.0.1:4000".to_string(),
            shared,
            Arc::new(table),
            shutdown.clone(),
        ));
        (client, handle, shutdown)
    }

    async fn read_some(client: &mut tokio::io::DuplexStream) -> Vec<u8> {
        let mut buf = vec![0u8; 4096];
        let n = client.read(&mut buf).await.unwrap();
        buf.truncate(n);
        buf
    }

    #[tokio::test]
    async fn ping_round_trip() {
        let (_dir, shared) = build_shared();
        let (mut client, _handle, _shutdown) = spawn_server(shared, CommandTable::new());

        client.write_all(b"*1\r\n$4\r\nping\r\n").await.unwrap();
        assert_eq!(read_some(&mut client).await, b"+PONG\r\n");
    }

    #[tokio::test]
    async fn unknown_commands_keep_the_connection_open() {
        let (_dir, shared) = build_shared();
        let (mut client, _handle, _shutdown) = spawn_server(shared, CommandTable::new());

        client.write_all(b"*1\r\n$3\r\nfoo\r\n").await.unwrap();
        assert_eq!(read_some(&mut client).await, b"-Unknown command: 'foo'\r\n");

        client.write_all(b"*1\r\n$4\r\nping\r\n").await.unwrap();
        assert_eq!(read_some(&mut client).await, b"+PONG\r\n");
    }

    #[tokio::test]
    async fn protocol_errors_are_reported_and_survive() {
        let (_dir, shared) = build_shared();
        let (mut client, _handle, _shutdown) = spawn_server(shared, CommandTable::new());

        client.write_all(b"*a\r\n").await.unwrap();
        assert_eq!(
            read_some(&mut client).await,
            b"-Protocol Error: Invalid Array length\r\n"
        );

        client.write_all(b"*1\r\n$4\r\nping\r\n").await.unwrap();
        assert_eq!(read_some(&mut client).await, b"+PONG\r\n");
    }

    #[tokio::test]
    async fn requests_split_across_writes_resume() {
        let (_dir, shared) = build_shared();
        let (mut client, _handle, _shutdown) = spawn_server(shared, CommandTable::new());

        client.write_all(b"*2\r\n$7\r\ngetmeta\r\n$1\r").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        client.write_all(b"\nk\r\n").await.unwrap();
        assert_eq!(read_some(&mut client).await, b"$-1\r\n");
    }

    #[tokio::test]
    async fn pipelined_requests_answer_in_order() {
        let (_dir, shared) = build_shared();
        let (mut client, _handle, _shutdown) = spawn_server(shared, CommandTable::new());

        client
            .write_all(b"*1\r\n$4\r\nping\r\n*3\r\n$7\r\nsetmeta\r\n$1\r\nk\r\n$1\r\nv\r\n*2\r\n$7\r\ngetmeta\r\n$1\r\nk\r\n")
            .await
            .unwrap();

        let mut collected = Vec::new();
        while collected.len() < b"+PONG\r\n+OK\r\n$1\r\nv\r\n".len() {
            collected.extend_from_slice(&read_some(&mut client).await);
        }
        assert_eq!(collected, b"+PONG\r\n+OK\r\n$1\r\nv\r\n");
    }

    #[tokio::test]
    async fn async_replies_wait_for_earlier_requests() {
        let mut table = CommandTable::new();
        table.register(
            "slow",
            Command::async_fn(
                |key, _cmd, ctx| {
                    let replies = ctx.reply_sender();
                    tokio::spawn(async move {
                        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                        let _ = replies
                            .send(Frame::new(key, RespValue::Simple("SLOW".to_string())));
                    });
                    RespValue::Pending
                },
                0,
                0,
            ),
        );
        let (_dir, shared) = build_shared();
        let (mut client, _handle, _shutdown) = spawn_server(shared, table);

        // The fast PING completes first but must be emitted second.
        client
            .write_all(b"*1\r\n$4\r\nslow\r\n*1\r\n$4\r\nping\r\n")
            .await
            .unwrap();

        let mut collected = Vec::new();
        while collected.len() < b"+SLOW\r\n+PONG\r\n".len() {
            collected.extend_from_slice(&read_some(&mut client).await);
        }
        assert_eq!(collected, b"+SLOW\r\n+PONG\r\n");
    }

    #[tokio::test]
    async fn closing_sends_goaway_and_settles_the_counter() {
        let (_dir, shared) = build_shared();
        let (mut client, handle, _shutdown) = spawn_server(shared.clone(), CommandTable::new());

        client.write_all(b"*1\r\n$4\r\nping\r\n").await.unwrap();
        assert_eq!(read_some(&mut client).await, b"+PONG\r\n");
        assert_eq!(shared.connection_count(), 1);

        // Half-close: the server sees EOF and says goodbye.
        client.shutdown().await.unwrap();
        assert_eq!(read_some(&mut client).await, b"-GOAWAY\r\n");

        handle.await.unwrap().unwrap();
        assert_eq!(shared.connection_count(), 0);
    }

    #[tokio::test]
    async fn cancellation_closes_with_goaway() {
        let (_dir, shared) = build_shared();
        let (mut client, handle, shutdown) = spawn_server(shared, CommandTable::new());

        shutdown.cancel();
        assert_eq!(read_some(&mut client).await, b"-GOAWAY\r\n");
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn monitor_broadcasts_flow_between_connections() {
        let (_dir, shared) = build_shared();
        let (mut watcher, _h1, _s1) = spawn_server(shared.clone(), CommandTable::new());
        let (mut worker, _h2, _s2) = spawn_server(shared.clone(), CommandTable::new());

        watcher.write_all(b"*1\r\n$7\r\nmonitor\r\n").await.unwrap();
        assert_eq!(read_some(&mut watcher).await, b"+OK\r\n");

        worker.write_all(b"*1\r\n$4\r\nping\r\n").await.unwrap();
        assert_eq!(read_some(&mut worker).await, b"+PONG\r\n");

        let line = read_some(&mut watcher).await;
        let line = String::from_utf8(line).unwrap();
        assert!(line.starts_with('+'), "line: {line}");
        assert!(line.contains("\"ping\""), "line: {line}");
    }
}
