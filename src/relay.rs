use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Direction, ForwardError};

pub const BUFFER_SIZE: usize = 8192;

/// Bytes moved in each direction over the lifetime of one relayed connection.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub client_to_upstream: u64,
    pub upstream_to_client: u64,
}

/// Copies bytes between `client` and `upstream` until either direction ends.
///
/// The first direction to finish (EOF, reset or I/O error) cancels a token
/// shared with the other direction, which stops at its next read or write.
/// Both streams are dropped, and therefore closed, before this returns.
/// Cancelling `shutdown` tears the relay down the same way.
///
/// The byte counts are returned even when a direction failed, together with
/// the first transport error.
pub async fn pipe<C, U>(
    client: C,
    upstream: U,
    shutdown: &CancellationToken,
) -> (RelayStats, Result<(), ForwardError>)
where
    C: AsyncRead + AsyncWrite,
    U: AsyncRead + AsyncWrite,
{
    let done = shutdown.child_token();
    let (mut client_reader, mut client_writer) = tokio::io::split(client);
    let (mut upstream_reader, mut upstream_writer) = tokio::io::split(upstream);

    let ((sent, outbound), (received, inbound)) = tokio::join!(
        copy_until_done(
            &mut client_reader,
            &mut upstream_writer,
            &done,
            Direction::ClientToUpstream,
        ),
        copy_until_done(
            &mut upstream_reader,
            &mut client_writer,
            &done,
            Direction::UpstreamToClient,
        ),
    );

    drop((client_reader, client_writer));
    drop((upstream_reader, upstream_writer));

    let stats = RelayStats {
        client_to_upstream: sent,
        upstream_to_client: received,
    };
    (stats, outbound.and(inbound))
}

async fn copy_until_done<R, W>(
    reader: &mut R,
    writer: &mut W,
    done: &CancellationToken,
    direction: Direction,
) -> (u64, Result<(), ForwardError>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = [0u8; BUFFER_SIZE];
    let mut total = 0u64;

    let result = loop {
        let n = tokio::select! {
            () = done.cancelled() => break Ok(()),
            read = reader.read(&mut buffer) => match read {
                Ok(0) => {
                    debug!(%direction, "Stream reached EOF");
                    break Ok(());
                }
                Ok(n) => n,
                Err(source) => break Err(ForwardError::Transport { direction, source }),
            },
        };

        let write = async {
            writer.write_all(&buffer[..n]).await?;
            writer.flush().await
        };
        tokio::select! {
            () = done.cancelled() => break Ok(()),
            written = write => {
                if let Err(source) = written {
                    break Err(ForwardError::Transport { direction, source });
                }
            }
        }

        debug!(%direction, bytes = n, "Forwarded data");
        total += n as u64;
    };

    done.cancel();
    (total, result)
}
