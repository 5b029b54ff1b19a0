use crate::config::FramingConfig;
use crate::delegate::FramedListenDelegate;
use crate::transport::FramedTransport;
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock, Weak};
use stream::delegate::ListenDelegate;
use stream::transport::StreamTransport;
use stream::StreamTransportFactory;
use tracing::debug;

struct FramedFactoryInner {
    weak_self: Weak<FramedFactoryInner>,
    config: Arc<FramingConfig>,
    stream_factory: StreamTransportFactory,
    manager: RwLock<FxHashMap<SocketAddr, Arc<FramedTransport>>>,
    delegate: RwLock<Option<Weak<dyn FramedListenDelegate>>>,
}

/// Factory for [FramedTransport]s: wraps every stream transport the layer below creates -
///  actively dialed or passively accepted - and keeps the `address -> transport` map that is
///  the source of truth for transport lifetimes.
pub struct FramedTransportFactory {
    inner: Arc<FramedFactoryInner>,
}

impl FramedTransportFactory {
    pub fn new(config: FramingConfig, identity: [u8; 32]) -> anyhow::Result<FramedTransportFactory> {
        config.validate()?;
        let stream_factory = StreamTransportFactory::new(config.stream.clone(), identity)?;

        Ok(FramedTransportFactory {
            inner: Arc::new_cyclic(|weak_self| FramedFactoryInner {
                weak_self: weak_self.clone(),
                config: Arc::new(config),
                stream_factory,
                manager: RwLock::new(FxHashMap::default()),
                delegate: RwLock::new(None),
            }),
        })
    }

    pub async fn bind(&self, addr: SocketAddr) -> anyhow::Result<()> {
        self.inner.stream_factory.bind(addr).await
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.stream_factory.local_addr()
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.inner.stream_factory.public_key()
    }

    pub fn listen(&self, delegate: Weak<dyn FramedListenDelegate>) -> anyhow::Result<()> {
        *self.inner.delegate.write().unwrap() = Some(delegate);
        self.inner.stream_factory.listen(self.inner.weak_self.clone() as Weak<dyn ListenDelegate>)
    }

    pub async fn dial(
        &self,
        addr: SocketAddr,
        delegate: Weak<dyn FramedListenDelegate>,
        remote_static_pk: Option<[u8; 32]>,
    ) -> anyhow::Result<Arc<FramedTransport>> {
        *self.inner.delegate.write().unwrap() = Some(delegate);

        if let Some(existing) = self.get_transport(addr) {
            return Ok(existing);
        }

        // wrapping happens in our did_create_transport, fired from inside the dial
        self.inner
            .stream_factory
            .dial(addr, self.inner.weak_self.clone() as Weak<dyn ListenDelegate>, remote_static_pk)
            .await?;

        match self.get_transport(addr) {
            Some(transport) => Ok(transport),
            None => anyhow::bail!("dial to {:?} produced no transport", addr),
        }
    }

    pub fn get_transport(&self, addr: SocketAddr) -> Option<Arc<FramedTransport>> {
        self.inner.manager.read().unwrap().get(&addr).cloned()
    }

    pub fn num_transports(&self) -> usize {
        self.inner.manager.read().unwrap().len()
    }
}

impl FramedFactoryInner {
    fn listen_delegate(&self) -> Option<Arc<dyn FramedListenDelegate>> {
        self.delegate.read().unwrap().as_ref().and_then(|weak| weak.upgrade())
    }
}

#[async_trait]
impl ListenDelegate for FramedFactoryInner {
    async fn should_accept(&self, addr: SocketAddr) -> bool {
        match self.listen_delegate() {
            Some(delegate) => delegate.should_accept(addr).await,
            None => false,
        }
    }

    async fn did_create_transport(&self, stream_transport: Arc<StreamTransport>) {
        let peer_addr = stream_transport.peer_addr().await;

        let manager_weak = self.weak_self.clone();
        let on_closed = Box::new(move |t: &FramedTransport| {
            if let Some(inner) = manager_weak.upgrade() {
                inner.manager.write().unwrap().retain(|_, known| !std::ptr::eq(known.as_ref(), t));
            }
        });

        let framed = FramedTransport::new(self.config.clone(), stream_transport.clone(), on_closed);
        stream_transport.setup(Arc::downgrade(&framed) as Weak<dyn stream::TransportDelegate>);
        self.manager.write().unwrap().insert(peer_addr, framed.clone());

        debug!("wrapped transport for {:?}", peer_addr);
        if let Some(delegate) = self.listen_delegate() {
            delegate.did_create_transport(framed).await;
        }
    }
}
