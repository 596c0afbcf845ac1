//! UDP serve loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tracing::{error, warn};

use crate::dispatcher::Dispatcher;

/// Receive buffer size; one byte over the largest legal envelope so oversized
/// datagrams are seen as such rather than silently truncated.
const RECV_BUFFER_BYTES: usize = 65_536;

/// Receive datagrams forever, dispatching each on its own task.
///
/// Receive errors are logged and retried; this only returns if the task is
/// cancelled.
pub async fn serve(socket: Arc<UdpSocket>, dispatcher: Arc<Dispatcher>) {
    let mut buf = vec![0u8; RECV_BUFFER_BYTES];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, from)) => {
                let datagram = buf[..len].to_vec();
                let socket = Arc::clone(&socket);
                let dispatcher = Arc::clone(&dispatcher);
                tokio::spawn(async move {
                    for out in dispatcher.handle(from, &datagram).await {
                        if let Err(e) = socket.send_to(&out.bytes, out.to).await {
                            warn!(to = %out.to, error = %e, "Failed to send datagram");
                        }
                    }
                });
            }
            Err(e) => {
                error!(error = %e, "UDP receive failed; retrying");
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
}
