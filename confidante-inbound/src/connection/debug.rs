use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use anyhow::{Error, anyhow};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use uuid::Uuid;

use confidante_core::utils::recorder::StreamRecorder;
use confidante_core::xmpp::stream::Connection;

/// Wraps a connection, tee-ing its raw bytes to `log/{uuid}.{in,out}.xml`
/// for offline inspection. Never consulted for protocol decisions.
pub struct DebugConnection<C> {
    uuid: Uuid,
    recorder: StreamRecorder<C>,
}

impl<C> DebugConnection<C> {
    pub async fn try_new(inner: C) -> std::io::Result<Self> {
        let uuid = Uuid::new_v4();
        let recorder = StreamRecorder::try_new(inner, uuid).await?;
        Ok(Self { uuid, recorder })
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }
}

impl<C> Connection for DebugConnection<C>
where
    C: Connection + Send + 'static,
    C::Upgrade: Future<Output = Result<C, Error>> + Send + 'static,
{
    type Upgrade = DebugConnectionUpgrade<C>;

    fn upgrade(self) -> Result<Self::Upgrade, Error> {
        let uuid = self.uuid;
        let inner = self.recorder.into_inner();
        let upgrade = inner.upgrade()?;

        Ok(DebugConnectionUpgrade {
            state: DebugConnectionUpgradeState::Upgrading(uuid, Box::pin(upgrade)),
        })
    }

    fn is_starttls_allowed(&self) -> bool {
        self.recorder.get_ref().is_starttls_allowed()
    }

    fn is_secure(&self) -> bool {
        self.recorder.get_ref().is_secure()
    }

    fn is_authenticated(&self) -> bool {
        self.recorder.get_ref().is_authenticated()
    }
}

impl<C: AsyncRead + Unpin> AsyncRead for DebugConnection<C> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().recorder).poll_read(cx, buf)
    }
}

impl<C: AsyncWrite + Unpin> AsyncWrite for DebugConnection<C> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.get_mut().recorder).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().recorder).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().recorder).poll_shutdown(cx)
    }
}

enum DebugConnectionUpgradeState<C>
where
    C: Connection,
    C::Upgrade: Future<Output = Result<C, Error>>,
{
    Upgrading(Uuid, Pin<Box<C::Upgrade>>),
    ConstructingRecorder(
        Uuid,
        Pin<Box<dyn Future<Output = std::io::Result<StreamRecorder<C>>> + Send>>,
    ),
}

pub struct DebugConnectionUpgrade<C>
where
    C: Connection,
    C::Upgrade: Future<Output = Result<C, Error>>,
{
    state: DebugConnectionUpgradeState<C>,
}

impl<C> Future for DebugConnectionUpgrade<C>
where
    C: Connection + Send + 'static,
    C::Upgrade: Future<Output = Result<C, Error>> + Send + 'static,
{
    type Output = Result<DebugConnection<C>, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        loop {
            match &mut this.state {
                DebugConnectionUpgradeState::Upgrading(uuid, upgrade) => {
                    let uuid = *uuid;
                    match upgrade.as_mut().poll(cx) {
                        Poll::Ready(Ok(upgraded)) => {
                            this.state = DebugConnectionUpgradeState::ConstructingRecorder(
                                uuid,
                                Box::pin(StreamRecorder::try_new(upgraded, uuid)),
                            );
                        }
                        Poll::Ready(Err(err)) => return Poll::Ready(Err(err)),
                        Poll::Pending => return Poll::Pending,
                    }
                }
                DebugConnectionUpgradeState::ConstructingRecorder(uuid, future) => {
                    let uuid = *uuid;
                    return future.as_mut().poll(cx).map(|result| {
                        result
                            .map(|recorder| DebugConnection { uuid, recorder })
                            .map_err(|err| anyhow!(err))
                    });
                }
            }
        }
    }
}
