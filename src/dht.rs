//! Dht node: a background actor thread driving [Rpc], and a cheap cloneable
//! handle to talk to it.

use std::net::SocketAddrV4;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use tracing::debug;

use crate::common::{Contact, Id};
use crate::rpc::{Config, Info, PutError, Rpc, StoreReport};

/// A handle to a running node.
///
/// Cloning is cheap; all clones talk to the same background thread. The
/// thread keeps running until [Dht::shutdown] or the last handle is dropped.
#[derive(Debug, Clone)]
pub struct Dht(flume::Sender<ActorMessage>);

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[error("DHT node was shutdown")]
pub struct DhtWasShutdown;

pub(crate) enum ActorMessage {
    Info(flume::Sender<Info>),
    Ping(SocketAddrV4, flume::Sender<bool>),
    FindNode(Id, flume::Sender<Box<[Contact]>>),
    Get(Id, flume::Sender<Option<Bytes>>),
    Put(Id, Bytes, flume::Sender<Result<StoreReport, PutError>>),
    Shutdown(flume::Sender<()>),
}

impl Dht {
    /// Binds a UDP socket and starts the node's actor thread.
    pub fn new(config: Config) -> Result<Dht, std::io::Error> {
        // Bind on the caller's thread so bind errors surface here.
        let rpc = Rpc::new(config)?;

        let (sender, receiver) = flume::unbounded();

        thread::Builder::new()
            .name("xordht".into())
            .spawn(move || run(rpc, receiver))?;

        Ok(Dht(sender))
    }

    // === Getters ===

    /// Information and statistics about this node.
    pub fn info(&self) -> Result<Info, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded(1);

        self.0
            .send(ActorMessage::Info(sender))
            .map_err(|_| DhtWasShutdown)?;

        receiver.recv().map_err(|_| DhtWasShutdown)
    }

    /// The identifier this node joined the network under.
    pub fn id(&self) -> Result<Id, DhtWasShutdown> {
        Ok(self.info()?.id)
    }

    /// The address the node's UDP socket is listening on.
    pub fn local_addr(&self) -> Result<SocketAddrV4, DhtWasShutdown> {
        Ok(self.info()?.local_addr)
    }

    // === Public Methods ===

    /// Pings a node directly, returning whether it answered within the
    /// request timeout.
    pub fn ping(&self, address: SocketAddrV4) -> Result<bool, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded(1);

        self.0
            .send(ActorMessage::Ping(address, sender))
            .map_err(|_| DhtWasShutdown)?;

        receiver.recv().map_err(|_| DhtWasShutdown)
    }

    /// Returns whether this node knows any peers, after running a lookup of
    /// its own id to give a fresh node a chance to join through its
    /// bootstrap addresses.
    pub fn bootstrapped(&self) -> Result<bool, DhtWasShutdown> {
        let id = self.id()?;

        Ok(!self.find_node(id)?.is_empty())
    }

    /// Looks up the k closest nodes to `target`, blocking until the
    /// iterative lookup settles.
    pub fn find_node(&self, target: Id) -> Result<Box<[Contact]>, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded(1);

        self.0
            .send(ActorMessage::FindNode(target, sender))
            .map_err(|_| DhtWasShutdown)?;

        receiver.recv().map_err(|_| DhtWasShutdown)
    }

    /// Resolves the value stored under `key`, or None if no node close to
    /// the key holds a fresh record for it.
    pub fn get(&self, key: Id) -> Result<Option<Bytes>, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded(1);

        self.0
            .send(ActorMessage::Get(key, sender))
            .map_err(|_| DhtWasShutdown)?;

        receiver.recv().map_err(|_| DhtWasShutdown)
    }

    /// Publishes `value` under `key` to the k closest nodes to the key.
    ///
    /// Succeeds as long as at least one node acknowledged storing the
    /// record; the report says how many did.
    pub fn put(&self, key: Id, value: Bytes) -> Result<StoreReport, PutError> {
        let (sender, receiver) = flume::bounded(1);

        self.0
            .send(ActorMessage::Put(key, value, sender))
            .map_err(|_| DhtWasShutdown)?;

        receiver.recv().map_err(|_| DhtWasShutdown)?
    }

    /// Stops the actor thread, blocking until it wound down.
    pub fn shutdown(&mut self) {
        let (sender, receiver) = flume::bounded(1);

        if self.0.send(ActorMessage::Shutdown(sender)).is_ok() {
            let _ = receiver.recv();
        }
    }
}

fn run(mut rpc: Rpc, receiver: flume::Receiver<ActorMessage>) {
    loop {
        match receiver.try_recv() {
            Ok(ActorMessage::Info(sender)) => {
                let _ = sender.send(rpc.info());
            }
            Ok(ActorMessage::Ping(address, sender)) => rpc.ping(address, sender),
            Ok(ActorMessage::FindNode(target, sender)) => rpc.find_node(target, sender),
            Ok(ActorMessage::Get(key, sender)) => rpc.get(key, sender),
            Ok(ActorMessage::Put(key, value, sender)) => rpc.put(key, value, Some(sender)),
            Ok(ActorMessage::Shutdown(sender)) => {
                debug!(id = %rpc.id(), "Node shutting down");

                drop(receiver);
                let _ = sender.send(());
                break;
            }
            Err(flume::TryRecvError::Disconnected) => {
                debug!(id = %rpc.id(), "All handles dropped, node shutting down");
                break;
            }
            Err(flume::TryRecvError::Empty) => {}
        }

        rpc.tick();
    }
}

/// A local network of nodes for tests and examples.
///
/// The first node starts alone; every other node bootstraps through it.
pub struct Testnet {
    pub bootstrap: Vec<SocketAddrV4>,
    pub nodes: Vec<Dht>,
}

impl Testnet {
    pub fn new(count: usize) -> Result<Testnet, std::io::Error> {
        let mut nodes: Vec<Dht> = Vec::with_capacity(count);
        let mut bootstrap = Vec::new();

        for index in 0..count {
            let node = Dht::new(Config {
                bootstrap: bootstrap.clone(),
                request_timeout: Duration::from_millis(200),
                ..Default::default()
            })?;

            if index == 0 {
                let address = node
                    .local_addr()
                    .expect("node was just started on this thread");
                bootstrap.push(address);
            }

            nodes.push(node);
        }

        Ok(Testnet { bootstrap, nodes })
    }
}
