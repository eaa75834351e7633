//! Unix socket RPC server
//!
//! Hardened line-delimited JSON frontend over a Unix domain socket:
//! peer-credential audit logging, connection limits, bounded reads, and
//! read/write timeouts. Unary requests dispatch into the control plane on
//! the blocking pool; subscription requests take over their connection and
//! bridge monitor callbacks onto the stream through a bounded channel.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

use vigil_core::{api, ClientCtx, EventClientCtx, System, WatchClientCtx};
use vigil_error::{ApiError, ApiStatus, ErrorCode};
use vigil_protocol::{
    EventInfo, Request, RequestEnvelope, ResponseData, ResponseEnvelope, StreamEnvelope,
    StreamItem, WatchInfo, MAX_MESSAGE_SIZE,
};

use crate::trace::TraceHandle;

/// Maximum concurrent client connections
const MAX_CONNECTIONS: usize = 64;

/// Read timeout per message
const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Write timeout per message
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Buffered stream items per subscription; a client that falls this far
/// behind is treated as dead
const STREAM_QUEUE_DEPTH: usize = 64;

/// Socket permissions
const SOCKET_MODE: u32 = 0o666;

/// Global connection counter
static ACTIVE_CONNECTIONS: AtomicUsize = AtomicUsize::new(0);

/// Run the socket server until a termination signal arrives
pub async fn run_server(
    socket_path: &str,
    sys: Arc<System>,
    trace_handle: Arc<TraceHandle>,
) -> Result<(), anyhow::Error> {
    let path = Path::new(socket_path);
    if path.exists() {
        let metadata = path.symlink_metadata()?;
        if metadata.file_type().is_symlink() {
            anyhow::bail!("socket path is a symlink - refusing for security");
        }
        std::fs::remove_file(path)?;
        debug!("removed existing socket file");
    }

    let listener = UnixListener::bind(socket_path)?;
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(SOCKET_MODE))?;
    }
    info!("listening on {} (mode {:o})", socket_path, SOCKET_MODE);
    info!(
        "limits: max_conn={}, max_msg={}, stream_depth={}",
        MAX_CONNECTIONS, MAX_MESSAGE_SIZE, STREAM_QUEUE_DEPTH
    );

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let current = ACTIVE_CONNECTIONS.load(Ordering::SeqCst);
                        if current >= MAX_CONNECTIONS {
                            warn!("connection limit reached ({}), rejecting", current);
                            drop(stream);
                            continue;
                        }
                        ACTIVE_CONNECTIONS.fetch_add(1, Ordering::SeqCst);
                        let sys = sys.clone();
                        let trace_handle = trace_handle.clone();
                        tokio::spawn(async move {
                            handle_client(stream, sys, trace_handle).await;
                            ACTIVE_CONNECTIONS.fetch_sub(1, Ordering::SeqCst);
                        });
                    }
                    Err(e) => error!("accept error: {}", e),
                }
            }
            _ = &mut shutdown => {
                info!("shutdown signal received");
                break;
            }
        }
    }

    let _ = std::fs::remove_file(socket_path);
    info!("server stopped");
    Ok(())
}

/// Client credentials from the Unix socket peer
#[derive(Debug, Clone, Copy)]
struct PeerCredentials {
    uid: u32,
    gid: u32,
    pid: i32,
}

impl PeerCredentials {
    fn label(&self) -> String {
        format!("uid={},pid={}", self.uid, self.pid)
    }
}

fn get_peer_credentials(stream: &UnixStream) -> Option<PeerCredentials> {
    use std::os::unix::io::AsRawFd;

    let fd = stream.as_raw_fd();

    #[cfg(target_os = "linux")]
    {
        // SAFETY: ucred is a plain C struct; zeroing it is a valid initial
        // state for getsockopt to fill.
        let mut cred: libc::ucred = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;
        // SAFETY: fd is a live socket, cred/len point at properly sized
        // storage for SO_PEERCRED.
        let result = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_PEERCRED,
                &mut cred as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };
        if result == 0 {
            return Some(PeerCredentials {
                uid: cred.uid,
                gid: cred.gid,
                pid: cred.pid,
            });
        }
        None
    }

    #[cfg(not(target_os = "linux"))]
    {
        let mut uid: libc::uid_t = 0;
        let mut gid: libc::gid_t = 0;
        // SAFETY: fd is a live socket, uid/gid are valid out-pointers.
        let result = unsafe { libc::getpeereid(fd, &mut uid, &mut gid) };
        if result == 0 {
            return Some(PeerCredentials { uid, gid, pid: 0 });
        }
        None
    }
}

/// Read one newline-terminated message without buffering past the limit
async fn read_line_bounded<R: tokio::io::AsyncBufRead + Unpin>(
    reader: &mut R,
    out: &mut Vec<u8>,
    max_len: usize,
) -> std::io::Result<usize> {
    out.clear();

    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(0);
        }

        let mut take_len = available.len();
        let mut found_newline = false;
        if let Some(pos) = available.iter().position(|b| *b == b'\n') {
            take_len = pos + 1;
            found_newline = true;
        }

        let remaining = max_len.saturating_sub(out.len());
        if take_len > remaining {
            let consume_len = remaining.min(available.len());
            reader.consume(consume_len);
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "Message too large",
            ));
        }

        out.extend_from_slice(&available[..take_len]);
        reader.consume(take_len);

        if found_newline {
            return Ok(out.len());
        }
    }
}

async fn handle_client(stream: UnixStream, sys: Arc<System>, trace_handle: Arc<TraceHandle>) {
    let cred = match get_peer_credentials(&stream) {
        Some(c) => c,
        None => {
            error!("failed to get peer credentials, rejecting connection");
            return;
        }
    };
    info!(
        "connection from uid={}, gid={}, pid={}",
        cred.uid, cred.gid, cred.pid
    );

    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line: Vec<u8> = Vec::with_capacity(4096);
    let mut request_count: u64 = 0;

    loop {
        let read_result = timeout(
            READ_TIMEOUT,
            read_line_bounded(&mut reader, &mut line, MAX_MESSAGE_SIZE),
        )
        .await;

        match read_result {
            Ok(Ok(0)) => {
                debug!("client disconnected: {}, requests={}", cred.label(), request_count);
                break;
            }
            Ok(Ok(n)) => {
                request_count += 1;
                trace!("request #{} from {}: {} bytes", request_count, cred.label(), n);

                let envelope: RequestEnvelope = match std::str::from_utf8(&line)
                    .ok()
                    .and_then(|s| serde_json::from_str(s.trim()).ok())
                {
                    Some(envelope) => envelope,
                    None => {
                        debug!("malformed request from {}", cred.label());
                        let rsp = ResponseEnvelope::failure(0, ApiStatus::InvalidArg, ErrorCode::None);
                        if send_response(&mut writer, &rsp).await.is_err() {
                            break;
                        }
                        continue;
                    }
                };
                let id = envelope.id;
                let request = envelope.request;

                if let Err(e) = request.validate() {
                    warn!(
                        "{} from {} failed validation: {}",
                        request.type_name(),
                        cred.label(),
                        e
                    );
                    let rsp = ResponseEnvelope::failure(id, ApiStatus::InvalidArg, ErrorCode::None);
                    if send_response(&mut writer, &rsp).await.is_err() {
                        break;
                    }
                    continue;
                }

                if is_mutation(&request) {
                    info!(
                        "AUDIT: {} (id={}) by uid={}, pid={}",
                        request.type_name(),
                        id,
                        cred.uid,
                        cred.pid
                    );
                } else {
                    debug!("processing {} (id={}) from {}", request.type_name(), id, cred.label());
                }

                if request.is_streaming() {
                    // the subscription owns the connection from here on
                    handle_stream(reader, writer, id, request, sys, cred).await;
                    return;
                }

                let rsp = dispatch_unary(id, request, sys.clone(), trace_handle.clone()).await;
                if send_response(&mut writer, &rsp).await.is_err() {
                    break;
                }
            }
            Ok(Err(e)) => {
                if e.kind() == std::io::ErrorKind::InvalidData {
                    warn!(
                        "message too large (>{} bytes) from {}",
                        MAX_MESSAGE_SIZE,
                        cred.label()
                    );
                    let rsp = ResponseEnvelope::failure(0, ApiStatus::InvalidArg, ErrorCode::None);
                    let _ = send_response(&mut writer, &rsp).await;
                } else {
                    error!("read error from {}: {}", cred.label(), e);
                }
                break;
            }
            Err(_) => {
                debug!("read timeout for {}", cred.label());
                break;
            }
        }
    }
}

/// Mutating requests get an audit log line
fn is_mutation(request: &Request) -> bool {
    matches!(
        request,
        Request::GpuUpdate { .. }
            | Request::GpuReset { .. }
            | Request::WatchCreate { .. }
            | Request::WatchDelete { .. }
            | Request::EventGen { .. }
            | Request::TraceUpdate { .. }
    )
}

/// Run one unary request on the blocking pool; the control plane may park
/// the calling thread on the bus
async fn dispatch_unary(
    id: u64,
    request: Request,
    sys: Arc<System>,
    trace_handle: Arc<TraceHandle>,
) -> ResponseEnvelope {
    tokio::task::spawn_blocking(move || process_unary(id, request, &sys, &trace_handle))
        .await
        .unwrap_or_else(|e| {
            error!("unary dispatch panicked: {}", e);
            ResponseEnvelope::failure(id, ApiStatus::Err, ErrorCode::Unknown)
        })
}

fn from_get_result<T>(
    id: u64,
    result: Result<T, ApiError>,
    into_data: impl FnOnce(T) -> ResponseData,
) -> ResponseEnvelope {
    match result {
        Ok(value) => ResponseEnvelope::ok(id, into_data(value)),
        Err(e) => ResponseEnvelope::failure(id, e.status, e.code),
    }
}

fn from_status(id: u64, (status, code): (ApiStatus, ErrorCode)) -> ResponseEnvelope {
    if status.is_ok() {
        ResponseEnvelope::ok(id, ResponseData::none())
    } else {
        ResponseEnvelope::failure(id, status, code)
    }
}

fn process_unary(
    id: u64,
    request: Request,
    sys: &System,
    trace_handle: &TraceHandle,
) -> ResponseEnvelope {
    match request {
        Request::Ping => ResponseEnvelope::ok(id, ResponseData::string("pong".into())),
        Request::Version => {
            ResponseEnvelope::ok(id, ResponseData::string(env!("CARGO_PKG_VERSION").into()))
        }
        Request::GpuGet { keys } => {
            from_get_result(id, api::gpu_get(sys, &keys), ResponseData::gpu_list)
        }
        Request::GpuUpdate { specs } => from_status(id, api::gpu_update(sys, specs)),
        Request::GpuReset { spec } => from_status(id, api::gpu_reset(sys, spec)),
        Request::GpuComputePartitionGet { keys } => from_get_result(
            id,
            api::compute_partition_get(sys, &keys),
            ResponseData::partition_list,
        ),
        Request::GpuBadPageGet { keys } => from_get_result(
            id,
            api::bad_page_get(sys, &keys),
            ResponseData::bad_page_list,
        ),
        Request::TopologyGet => {
            from_get_result(id, api::topology_get(sys), ResponseData::topology_list)
        }
        Request::WatchCreate { specs } => from_status(id, api::watch_create(sys, specs)),
        Request::WatchDelete { keys } => from_status(id, api::watch_delete(sys, &keys)),
        Request::WatchGet { keys } => {
            from_get_result(id, api::watch_get(sys, &keys), ResponseData::watch_list)
        }
        Request::EventGet { filter } => {
            from_get_result(id, api::event_get(sys, &filter), ResponseData::event_list)
        }
        Request::EventGen { spec } => from_status(id, api::event_gen(sys, &spec)),
        Request::TraceGet => ResponseEnvelope::ok(id, ResponseData::trace(trace_handle.get())),
        Request::TraceUpdate { level } => match trace_handle.update(level) {
            Ok(()) => ResponseEnvelope::ok(id, ResponseData::trace(level)),
            Err(e) => {
                warn!("trace update failed: {}", e);
                ResponseEnvelope::failure(id, ApiStatus::Err, ErrorCode::None)
            }
        },
        Request::TraceFlush => {
            trace_handle.flush();
            ResponseEnvelope::ok(id, ResponseData::none())
        }
        // streaming requests never reach the unary path
        Request::EventSubscribe { .. } | Request::WatchSubscribe { .. } => {
            ResponseEnvelope::failure(id, ApiStatus::InvalidArg, ErrorCode::None)
        }
    }
}

/// Drive one subscription: register a client context with the monitor, park
/// a blocking-pool thread on it, and pump stream items to the socket until
/// either side gives up. The context outlives the monitor's last reference;
/// the final unary response reports how the stream ended.
async fn handle_stream(
    mut reader: BufReader<OwnedReadHalf>,
    mut writer: OwnedWriteHalf,
    id: u64,
    request: Request,
    sys: Arc<System>,
    cred: PeerCredentials,
) {
    let (tx, mut rx) = tokio::sync::mpsc::channel::<String>(STREAM_QUEUE_DEPTH);
    let peer = cred.label();

    let mut park = match request {
        Request::EventSubscribe { filter } => {
            let ctx: Arc<EventClientCtx> = ClientCtx::new(
                peer.clone(),
                Box::new(move |event: &EventInfo| {
                    let env = StreamEnvelope {
                        id,
                        item: StreamItem::Event(event.clone()),
                    };
                    let line = serde_json::to_string(&env).map_err(|_| ())?;
                    tx.try_send(line).map_err(|_| ())
                }),
            );
            let sys = sys.clone();
            tokio::task::spawn_blocking(move || api::event_subscribe(&sys, &filter, ctx).err())
        }
        Request::WatchSubscribe { keys } => {
            let ctx: Arc<WatchClientCtx> = ClientCtx::new(
                peer.clone(),
                Box::new(move |info: &WatchInfo| {
                    let env = StreamEnvelope {
                        id,
                        item: StreamItem::Watch(info.clone()),
                    };
                    let line = serde_json::to_string(&env).map_err(|_| ())?;
                    tx.try_send(line).map_err(|_| ())
                }),
            );
            let sys = sys.clone();
            tokio::task::spawn_blocking(move || api::watch_subscribe(&sys, &keys, ctx).err())
        }
        _ => return,
    };

    let mut read_buf: Vec<u8> = Vec::with_capacity(256);
    let mut client_gone = false;
    let mut items_done = false;
    let error = loop {
        tokio::select! {
            joined = &mut park => {
                // the monitor signalled the context (or registration failed)
                break joined.unwrap_or_else(|e| {
                    error!("subscription task for {} panicked: {}", peer, e);
                    Some(ApiError::new(ApiStatus::Err, ErrorCode::Unknown))
                });
            }
            item = rx.recv(), if !items_done => {
                match item {
                    Some(line) => {
                        let write = timeout(WRITE_TIMEOUT, write_line(&mut writer, &line)).await;
                        if !matches!(write, Ok(Ok(()))) {
                            debug!("stream write to {} failed, closing queue", peer);
                            // the monitor sees the failure on its next push
                            rx.close();
                        }
                    }
                    None => items_done = true,
                }
            }
            read = read_line_bounded(&mut reader, &mut read_buf, MAX_MESSAGE_SIZE), if !client_gone => {
                match read {
                    Ok(0) | Err(_) => {
                        debug!("stream client {} went away", peer);
                        client_gone = true;
                        rx.close();
                    }
                    // requests on a subscribed connection are not served
                    Ok(_) => trace!("ignoring input on subscribed connection from {}", peer),
                }
            }
        }
    };

    let rsp = match error {
        None => ResponseEnvelope::ok(id, ResponseData::none()),
        Some(e) => ResponseEnvelope::failure(id, e.status, e.code),
    };
    let _ = send_response(&mut writer, &rsp).await;
    info!("stream for {} ended ({})", peer, rsp.status);
}

async fn write_line(writer: &mut OwnedWriteHalf, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await
}

async fn send_response(
    writer: &mut OwnedWriteHalf,
    rsp: &ResponseEnvelope,
) -> Result<(), ()> {
    let json = serde_json::to_string(rsp).unwrap_or_else(|_| {
        r#"{"id":0,"status":"err"}"#.to_string()
    });
    let write_result = timeout(WRITE_TIMEOUT, async {
        writer.write_all(json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        Ok::<_, std::io::Error>(())
    })
    .await;
    match write_result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            debug!("write error: {}", e);
            Err(())
        }
        Err(_) => {
            debug!("write timeout");
            Err(())
        }
    }
}
