//! TCP process group: rank 0 hosts the rendezvous and reduces for the group

use crate::group::{combine, CollectiveOp, Element, ProcessGroup, ReduceOp};
use crate::wire::{read_message, write_message, Message, PROTOCOL_VERSION};
use parking_lot::Mutex;
use runtime_core::{BackendKind, Error, NetworkConfig, Rank, Result, RuntimeHandle};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// Connections held by one member of the group
enum Links {
    /// Rank 0: one stream per peer, indexed by `rank - 1`
    Root { peers: Vec<TcpStream> },
    /// Any other rank: the stream to rank 0
    Peer { root: TcpStream },
}

struct TcpState {
    links: Links,
    seq: u64,
}

/// Process group whose collectives run over TCP streams in a star layout
pub struct TcpProcessGroup {
    rank: Rank,
    world_size: usize,
    max_frame_size: usize,
    runtime: RuntimeHandle,
    state: Mutex<TcpState>,
}

/// Strip the `tcp://` scheme off a rendezvous URL
pub fn parse_rendezvous_url(url: &str) -> Result<&str> {
    let addr = url.strip_prefix("tcp://").ok_or_else(|| Error::GroupJoin {
        url: url.to_string(),
        message: "expected a tcp://host:port URL".to_string(),
    })?;
    if addr.is_empty() {
        return Err(Error::GroupJoin {
            url: url.to_string(),
            message: "missing host:port".to_string(),
        });
    }
    Ok(addr)
}

impl TcpProcessGroup {
    /// Join the group rendezvousing at `url`; blocks until all members joined.
    ///
    /// Rank 0 binds the URL's address. Other ranks retry connecting every
    /// `network.connect_retry_interval` until rank 0 is listening.
    pub fn join(
        runtime: RuntimeHandle,
        url: &str,
        rank: Rank,
        world_size: usize,
        network: &NetworkConfig,
    ) -> Result<Self> {
        if world_size == 0 || rank >= world_size {
            return Err(Error::GroupJoin {
                url: url.to_string(),
                message: format!("rank {} outside world of size {}", rank, world_size),
            });
        }
        let addr = parse_rendezvous_url(url)?;

        let links = runtime.block_on(async {
            if rank == 0 {
                accept_peers(url, addr, world_size, network).await
            } else {
                connect_root(url, addr, rank, world_size, network).await
            }
        })?;

        info!(rank, world_size, url, "Joined TCP process group");

        Ok(Self {
            rank,
            world_size,
            max_frame_size: network.max_frame_size,
            runtime,
            state: Mutex::new(TcpState { links, seq: 0 }),
        })
    }

    fn collective<T: Element>(&self, op: CollectiveOp, buf: &mut [T]) -> Result<()> {
        let mut state = self.state.lock();
        let seq = state.seq;
        state.seq += 1;

        let world_size = self.world_size;
        let max_frame_size = self.max_frame_size;
        self.runtime.block_on(async {
            match &mut state.links {
                Links::Root { peers } => {
                    root_collective(peers, seq, op, buf, world_size, max_frame_size).await
                }
                Links::Peer { root } => {
                    peer_collective(root, seq, op, buf, max_frame_size).await
                }
            }
        })
    }
}

impl ProcessGroup for TcpProcessGroup {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn backend(&self) -> BackendKind {
        BackendKind::Tcp
    }

    fn all_reduce(&self, buf: &mut [f32], op: ReduceOp) -> Result<()> {
        self.collective(CollectiveOp::AllReduce(op), buf)
    }

    fn all_reduce_f64(&self, buf: &mut [f64], op: ReduceOp) -> Result<()> {
        self.collective(CollectiveOp::AllReduce(op), buf)
    }

    fn broadcast(&self, buf: &mut [f32]) -> Result<()> {
        self.collective(CollectiveOp::Broadcast, buf)
    }
}

async fn accept_peers(
    url: &str,
    addr: &str,
    world_size: usize,
    network: &NetworkConfig,
) -> Result<Links> {
    let join_error = |message: String| Error::GroupJoin {
        url: url.to_string(),
        message,
    };

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| join_error(format!("bind {}: {}", addr, e)))?;
    debug!(addr, "Rendezvous listening");

    let mut slots: Vec<Option<TcpStream>> = (1..world_size).map(|_| None).collect();
    let mut joined = 0;

    while joined < world_size - 1 {
        let (mut stream, remote) = listener.accept().await?;
        stream.set_nodelay(true)?;

        let hello = read_message(&mut stream, network.max_frame_size).await?;
        let verdict = match hello {
            Message::Hello {
                protocol,
                rank,
                world_size: claimed,
            } => {
                let rank = rank as usize;
                if protocol != PROTOCOL_VERSION {
                    Err(format!(
                        "protocol {} does not match {}",
                        protocol, PROTOCOL_VERSION
                    ))
                } else if claimed as usize != world_size {
                    Err(format!(
                        "rank {} expects world size {}, rendezvous has {}",
                        rank, claimed, world_size
                    ))
                } else if rank == 0 || rank >= world_size {
                    Err(format!("rank {} is not a valid peer rank", rank))
                } else if slots[rank - 1].is_some() {
                    Err(format!("rank {} joined twice", rank))
                } else {
                    Ok(rank)
                }
            }
            other => Err(format!("expected hello, got {:?}", other)),
        };

        match verdict {
            Ok(rank) => {
                debug!(rank, %remote, "Peer joined");
                slots[rank - 1] = Some(stream);
                joined += 1;
            }
            Err(reason) => {
                warn!(%remote, reason = %reason, "Rejecting peer");
                let _ = write_message(
                    &mut stream,
                    &Message::Reject {
                        reason: reason.clone(),
                    },
                )
                .await;
                return Err(join_error(reason));
            }
        }
    }

    let mut peers: Vec<TcpStream> = slots.into_iter().flatten().collect();
    let welcome = Message::Welcome {
        world_size: world_size as u32,
    };
    for stream in peers.iter_mut() {
        write_message(stream, &welcome).await?;
    }

    Ok(Links::Root { peers })
}

async fn connect_root(
    url: &str,
    addr: &str,
    rank: Rank,
    world_size: usize,
    network: &NetworkConfig,
) -> Result<Links> {
    let mut attempts: u64 = 0;
    let mut root = loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => break stream,
            Err(e) => {
                attempts += 1;
                if attempts % 50 == 1 {
                    debug!(addr, attempts, error = %e, "Rendezvous not reachable yet");
                }
                tokio::time::sleep(network.connect_retry_interval).await;
            }
        }
    };
    root.set_nodelay(true)?;

    write_message(
        &mut root,
        &Message::Hello {
            protocol: PROTOCOL_VERSION,
            rank: rank as u32,
            world_size: world_size as u32,
        },
    )
    .await?;

    match read_message(&mut root, network.max_frame_size).await? {
        Message::Welcome { world_size: w } if w as usize == world_size => {
            Ok(Links::Peer { root })
        }
        Message::Reject { reason } => Err(Error::GroupJoin {
            url: url.to_string(),
            message: reason,
        }),
        other => Err(Error::GroupJoin {
            url: url.to_string(),
            message: format!("unexpected reply {:?}", other),
        }),
    }
}

async fn root_collective<T: Element>(
    peers: &mut [TcpStream],
    seq: u64,
    op: CollectiveOp,
    buf: &mut [T],
    world_size: usize,
    max_frame_size: usize,
) -> Result<()> {
    let expected = match op {
        CollectiveOp::AllReduce(_) => buf.len(),
        CollectiveOp::Broadcast => 0,
    };
    let mut contributions: Vec<Vec<T>> = Vec::with_capacity(peers.len());
    let mut failure: Option<String> = None;

    // every peer is drained before any of them is answered
    for (index, stream) in peers.iter_mut().enumerate() {
        let peer_rank = index + 1;
        let message = match read_message(stream, max_frame_size).await {
            Ok(message) => message,
            Err(e) => {
                failure.get_or_insert_with(|| {
                    format!("rank {} failed during collective #{}: {}", peer_rank, seq, e)
                });
                continue;
            }
        };
        match message {
            Message::Contribute {
                seq: peer_seq,
                op: peer_op,
                len,
                data,
            } => {
                if peer_seq != seq || peer_op != op || len as usize != buf.len() {
                    failure.get_or_insert_with(|| {
                        format!(
                            "rank {} issued {:?} #{} over {} values, rank 0 issued {:?} #{} over {}",
                            peer_rank,
                            peer_op,
                            peer_seq,
                            len,
                            op,
                            seq,
                            buf.len()
                        )
                    });
                    continue;
                }
                let element = data.element();
                match T::unpack(data) {
                    Some(values) if values.len() == expected => contributions.push(values),
                    Some(values) => {
                        failure.get_or_insert_with(|| {
                            format!(
                                "rank {} sent {} values for collective #{}, expected {}",
                                peer_rank,
                                values.len(),
                                seq,
                                expected
                            )
                        });
                    }
                    None => {
                        failure.get_or_insert_with(|| {
                            format!("rank {} sent {} values for collective #{}", peer_rank, element, seq)
                        });
                    }
                }
            }
            other => {
                failure.get_or_insert_with(|| {
                    format!("rank {} sent {:?} during a collective", peer_rank, other)
                });
            }
        }
    }

    if let Some(reason) = failure {
        warn!(seq, reason = %reason, "Aborting collective");
        for stream in peers.iter_mut() {
            let _ = write_message(
                stream,
                &Message::Abort {
                    seq,
                    reason: reason.clone(),
                },
            )
            .await;
        }
        return Err(Error::Collective { message: reason });
    }

    if let CollectiveOp::AllReduce(_) = op {
        let mut ordered: Vec<&[T]> = Vec::with_capacity(world_size);
        ordered.push(&*buf);
        ordered.extend(contributions.iter().map(Vec::as_slice));
        let reduced = combine(op, &ordered, world_size);
        buf.copy_from_slice(&reduced);
    }

    let complete = Message::Complete {
        seq,
        data: T::pack(buf.to_vec()),
    };
    for stream in peers.iter_mut() {
        write_message(stream, &complete).await?;
    }
    Ok(())
}

async fn peer_collective<T: Element>(
    root: &mut TcpStream,
    seq: u64,
    op: CollectiveOp,
    buf: &mut [T],
    max_frame_size: usize,
) -> Result<()> {
    let data = match op {
        CollectiveOp::AllReduce(_) => buf.to_vec(),
        CollectiveOp::Broadcast => Vec::new(),
    };
    write_message(
        root,
        &Message::Contribute {
            seq,
            op,
            len: buf.len() as u64,
            data: T::pack(data),
        },
    )
    .await?;

    match read_message(root, max_frame_size).await? {
        Message::Complete { seq: done, data } if done == seq => match T::unpack(data) {
            Some(values) if values.len() == buf.len() => {
                buf.copy_from_slice(&values);
                Ok(())
            }
            _ => Err(Error::Collective {
                message: format!("result of collective #{} does not match the local buffer", seq),
            }),
        },
        Message::Abort { reason, .. } => Err(Error::Collective { message: reason }),
        other => Err(Error::Collective {
            message: format!("unexpected reply to collective #{}: {:?}", seq, other),
        }),
    }
}
