// The engine is the single coordinator behind the server. Clients talk to it
// over an unordered, at-least-once transport: a request may overtake the one
// issued before it, and a retransmitted request may show up after the original
// already ran. Every sequenced command therefore carries the issuing client's
// epoch, and the reorder buffer releases a client's commands strictly in epoch
// order. Clients are sequenced independently of each other, so one client's
// missing epoch never stalls anybody else.

// Everything here runs on one thread. The store, the client registry and the
// reorder buffer are plain fields of `Engine`, and the network layer owns the
// engine inside a single task. There is no per-array locking; serializing all
// commands through that task is what keeps expression evaluation from racing
// on shared store entries.

// Replies are decoupled from acceptance. A fetch or sync that arrives early
// sits in the reorder buffer together with its reply handle and only gets
// answered once the client's earlier commands have run.

use std::fmt;

use ndarray::{Array1, Array2};
use tracing::{debug, debug_span, info, warn};

pub mod array;
pub mod ast;
pub mod clients;
pub mod config;
pub mod epoch;
pub mod error;
pub mod eval;
pub mod store;
pub mod wire;

use self::{
    array::ArrayValue,
    ast::decode_ast,
    clients::ClientRegistry,
    config::EngineConfig,
    epoch::{Admission, ReorderBuffer},
    error::{EngineError, Result},
    eval::Evaluator,
    store::ArrayStore,
    wire::{
        decode_creation, decode_deletion_list, decode_fetch_target, decode_frame,
        CommandKind, Creation, Frame, Initializer, Reader, Reply,
    },
};

/// Opaque handle of a stored array, chosen by the client.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Name(pub u64);

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016X}", self.0)
    }
}

pub type ClientId = u8;

/// Position of a command in its client's sequence, starting at 0.
pub type Epoch = u64;

/// A sequenced command waiting in the reorder buffer, with the handle its
/// reply will be delivered to.
struct PendingCommand<R> {
    kind: CommandKind,
    payload: Vec<u8>,
    reply_to: R,
}

/// The command dispatcher. `R` is whatever the transport uses to route a
/// reply back to the request it belongs to.
pub struct Engine<R> {
    epochs: ReorderBuffer<PendingCommand<R>>,
    state: State,
}

struct State {
    store: ArrayStore,
    clients: ClientRegistry,
    config: EngineConfig,
}

impl<R> Engine<R> {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            epochs: ReorderBuffer::new(),
            state: State {
                store: ArrayStore::new(),
                clients: ClientRegistry::new(),
                config,
            },
        }
    }

    /// Handles one raw request.
    ///
    /// Returns a reply for every command that executed as a result, which may
    /// be none (the request was buffered or was a stale duplicate) or several
    /// (the request filled a gap and released buffered successors). Each
    /// reply is paired with the handle that came with its command. A stale
    /// duplicate's handle is dropped without a reply.
    pub fn dispatch(&mut self, frame: &[u8], reply_to: R) -> Vec<(R, Reply)> {
        let frame = match decode_frame(frame) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "rejecting malformed request");
                return vec![(reply_to, Reply::Failed(e.into()))];
            }
        };

        match frame {
            Frame::Connect => {
                let reply = match self.state.clients.connect() {
                    Ok(id) => {
                        self.epochs.reset(id);
                        info!(
                            client = id,
                            connected = self.state.clients.connected(),
                            "client connected"
                        );
                        Reply::Connected(id)
                    }
                    Err(e) => {
                        warn!(error = %e, "refusing connection");
                        Reply::Failed(e)
                    }
                };
                vec![(reply_to, reply)]
            }
            Frame::Shutdown => {
                let reply = if self.state.config.allow_remote_shutdown {
                    info!("shutdown requested by client");
                    Reply::ShuttingDown
                } else {
                    warn!("ignoring shutdown request, remote shutdown is disabled");
                    Reply::Failed(EngineError::unsupported("remote shutdown is disabled"))
                };
                vec![(reply_to, reply)]
            }
            Frame::Command { header, payload } => {
                let client = header.client;
                if !self.state.clients.is_leased(client) {
                    debug!(client, kind = ?header.kind, "command from unknown client");
                    return vec![(reply_to, Reply::Failed(EngineError::UnknownClient(client)))];
                }

                let command = PendingCommand {
                    kind: header.kind,
                    payload: payload.to_vec(),
                    reply_to,
                };
                let mut replies = Vec::new();
                let state = &mut self.state;
                let admission = self.epochs.submit(client, header.epoch, command, |epoch, command| {
                    let reply = state.execute(client, epoch, command.kind, &command.payload);
                    replies.push((command.reply_to, reply));
                });
                if admission == Admission::Stale {
                    debug!(client, epoch = header.epoch, "ignored duplicate command");
                }
                replies
            }
        }
    }

    pub fn store(&self) -> &ArrayStore {
        &self.state.store
    }

    pub fn clients(&self) -> &ClientRegistry {
        &self.state.clients
    }

    pub fn config(&self) -> &EngineConfig {
        &self.state.config
    }

    /// The next epoch `client` is expected to send.
    pub fn expected_epoch(&self, client: ClientId) -> Epoch {
        self.epochs.expected(client)
    }

    /// Commands of `client` waiting for an earlier epoch.
    pub fn buffered(&self, client: ClientId) -> usize {
        self.epochs.buffered(client)
    }
}

impl<R> Default for Engine<R> {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl State {
    fn execute(
        &mut self,
        client: ClientId,
        epoch: Epoch,
        kind: CommandKind,
        payload: &[u8],
    ) -> Reply {
        let span = debug_span!("command", client, epoch, ?kind);
        let _guard = span.enter();
        match self.run(client, kind, payload) {
            Ok(reply) => {
                debug!("command executed");
                reply
            }
            Err(e) => {
                warn!(error = %e, "command failed");
                Reply::Failed(e)
            }
        }
    }

    fn run(&mut self, client: ClientId, kind: CommandKind, payload: &[u8]) -> Result<Reply> {
        let mut reader = Reader::new(payload);
        match kind {
            CommandKind::Creation => {
                let creation = decode_creation(&mut reader)?;
                reader.finish()?;
                self.create(creation)?;
                Ok(Reply::Created)
            }
            CommandKind::Deletion => {
                let names = decode_deletion_list(&mut reader)?;
                reader.finish()?;
                for name in names {
                    self.store.remove(name);
                }
                Ok(Reply::Deleted)
            }
            CommandKind::Operation => {
                // decode everything before touching the store so a malformed
                // request has no effect at all
                let names = decode_deletion_list(&mut reader)?;
                let tree = decode_ast(&mut reader, self.config.max_ast_depth)?;
                reader.finish()?;
                for name in names {
                    self.store.remove(name);
                }
                let mut evaluator = Evaluator::new(&mut self.store, self.config.in_place_updates);
                evaluator.evaluate(&tree)?;
                Ok(Reply::Evaluated(evaluator.into_stored()))
            }
            CommandKind::Fetch => {
                let name = decode_fetch_target(&mut reader)?;
                reader.finish()?;
                match &**self.store.lookup(name)? {
                    ArrayValue::Scalar(value) | ArrayValue::Literal(value) => {
                        Ok(Reply::Value(*value))
                    }
                    other => Err(EngineError::mismatch(format!(
                        "only scalars can be fetched, {name} is a {}",
                        other.kind()
                    ))),
                }
            }
            CommandKind::Sync => {
                reader.finish()?;
                Ok(Reply::Synced)
            }
            CommandKind::Disconnect => {
                let id = reader.u8("client id")?;
                reader.finish()?;
                if id != client {
                    return Err(EngineError::unsupported(format!(
                        "client {client} cannot disconnect client {id}"
                    )));
                }
                self.clients.disconnect(id)?;
                info!(client = id, "client disconnected");
                Ok(Reply::Disconnected)
            }
            CommandKind::Connect | CommandKind::Shutdown => {
                Err(error::DecodeError::UnknownKind(kind as u8).into())
            }
        }
    }

    fn create(&mut self, creation: Creation) -> Result<()> {
        if !matches!(creation.dims.len(), 1 | 2) {
            return Err(EngineError::unsupported(format!(
                "{}-dimensional arrays",
                creation.dims.len()
            )));
        }
        check_shape(&creation.dims, self.config.max_array_elements)?;

        let Creation { name, dims, init } = creation;

        let value = if let [len] = dims[..] {
            let len = len as usize;
            ArrayValue::Vector(match init {
                Initializer::Buffer(values) => Array1::from_vec(values),
                Initializer::Fill(value) => Array1::from_elem(len, value),
                Initializer::Random => Array1::from_shape_simple_fn(len, rand::random),
            })
        } else {
            let shape = (dims[0] as usize, dims[1] as usize);
            ArrayValue::Matrix(match init {
                Initializer::Buffer(values) => Array2::from_shape_vec(shape, values)
                    .map_err(|e| EngineError::mismatch(format!("initial buffer: {e}")))?,
                Initializer::Fill(value) => Array2::from_elem(shape, value),
                Initializer::Random => Array2::from_shape_simple_fn(shape, rand::random),
            })
        };
        debug!(%name, ?dims, "created array");
        self.store.insert(name, value.into());
        Ok(())
    }
}

/// Rejects shapes that are over the element limit or that ndarray cannot
/// represent. Every axis is bounded on its own, so a zero axis does not hide
/// an oversized one.
fn check_shape(dims: &[u64], max: u64) -> Result<()> {
    let exhausted = || {
        EngineError::ResourceExhausted(format!(
            "array of shape {dims:?} exceeds the limit of {max} elements"
        ))
    };
    let axis_limit = max.min(isize::MAX as u64);
    if dims.iter().any(|&d| d > axis_limit) {
        return Err(exhausted());
    }
    let count = dims
        .iter()
        .try_fold(1u64, |acc, &d| acc.checked_mul(d))
        .ok_or_else(exhausted)?;
    // ndarray also needs the product of the non-zero axes to fit in isize
    let nonzero = dims
        .iter()
        .filter(|&&d| d != 0)
        .try_fold(1u64, |acc, &d| acc.checked_mul(d))
        .ok_or_else(exhausted)?;
    if count > max || nonzero > isize::MAX as u64 {
        return Err(exhausted());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{
        ast::{AstNode, Opcode},
        wire::{encode_command, encode_operation, encode_out_of_band, StoredResult},
        *,
    };

    type Tag = u32;

    fn connect(engine: &mut Engine<Tag>) -> ClientId {
        match engine.dispatch(&encode_out_of_band(CommandKind::Connect), 0).as_slice() {
            [(_, Reply::Connected(id))] => *id,
            other => panic!("unexpected connect reply {other:?}"),
        }
    }

    fn vector(name: u64, len: u64, fill: f64) -> Vec<u8> {
        Creation {
            name: Name(name),
            dims: vec![len],
            init: Initializer::Fill(fill),
        }
        .encode()
    }

    fn fetch(name: u64) -> Vec<u8> {
        name.to_le_bytes().to_vec()
    }

    fn send(
        engine: &mut Engine<Tag>,
        kind: CommandKind,
        client: ClientId,
        epoch: Epoch,
        payload: &[u8],
    ) -> Vec<(Tag, Reply)> {
        engine.dispatch(&encode_command(kind, client, epoch, payload), epoch as Tag)
    }

    /// Sends a creation and returns its only reply.
    fn create(
        engine: &mut Engine<Tag>,
        client: ClientId,
        epoch: Epoch,
        dims: Vec<u64>,
        init: Initializer,
    ) -> Reply {
        let creation = Creation {
            name: Name(100 + epoch),
            dims,
            init,
        };
        let mut replies = send(engine, CommandKind::Creation, client, epoch, &creation.encode());
        assert_eq!(replies.len(), 1);
        replies.remove(0).1
    }

    fn dot_tree() -> AstNode {
        dot_tree_of(1, 2, 3)
    }

    fn dot_tree_of(x: u64, y: u64, result: u64) -> AstNode {
        AstNode::op(
            Opcode::Matmul,
            Name(result),
            true,
            vec![AstNode::Name(Name(x)), AstNode::Name(Name(y))],
        )
    }

    #[test]
    fn dot_product_of_created_vectors() {
        let mut engine = Engine::default();
        let c = connect(&mut engine);
        assert_eq!(
            send(&mut engine, CommandKind::Creation, c, 0, &vector(1, 5, 2.0)),
            vec![(0, Reply::Created)]
        );
        assert_eq!(
            send(&mut engine, CommandKind::Creation, c, 1, &vector(2, 5, 2.0)),
            vec![(1, Reply::Created)]
        );
        assert_eq!(
            send(&mut engine, CommandKind::Operation, c, 2, &encode_operation(&[], &dot_tree())),
            vec![(2, Reply::Evaluated(vec![StoredResult { name: Name(3), dims: vec![] }]))]
        );
        assert_eq!(
            send(&mut engine, CommandKind::Fetch, c, 3, &fetch(3)),
            vec![(3, Reply::Value(20.0))]
        );
    }

    #[test]
    fn delayed_fetch_is_answered_when_its_epoch_is_reached() {
        let mut engine = Engine::default();
        let c = connect(&mut engine);
        let operation = encode_operation(&[], &dot_tree());
        assert!(send(&mut engine, CommandKind::Fetch, c, 3, &fetch(3)).is_empty());
        assert!(send(&mut engine, CommandKind::Operation, c, 2, &operation).is_empty());
        assert!(send(&mut engine, CommandKind::Creation, c, 1, &vector(2, 5, 2.0)).is_empty());
        assert_eq!(engine.buffered(c), 3);

        let replies = send(&mut engine, CommandKind::Creation, c, 0, &vector(1, 5, 2.0));
        let tags: Vec<Tag> = replies.iter().map(|(tag, _)| *tag).collect();
        assert_eq!(tags, vec![0, 1, 2, 3]);
        assert_eq!(replies[3].1, Reply::Value(20.0));
        assert_eq!(engine.expected_epoch(c), 4);

        // a late retransmission of epoch 0 runs nothing
        assert!(send(&mut engine, CommandKind::Creation, c, 0, &vector(1, 5, 9.0)).is_empty());
        assert_eq!(
            send(&mut engine, CommandKind::Fetch, c, 4, &fetch(3)),
            vec![(4, Reply::Value(20.0))]
        );
    }

    #[test]
    fn failed_commands_still_advance_the_epoch() {
        let mut engine = Engine::default();
        let c = connect(&mut engine);
        assert!(send(&mut engine, CommandKind::Sync, c, 1, &[]).is_empty());
        let replies = send(&mut engine, CommandKind::Fetch, c, 0, &fetch(42));
        assert_eq!(
            replies,
            vec![
                (0, Reply::Failed(EngineError::UnknownName(Name(42)))),
                (1, Reply::Synced),
            ]
        );
    }

    #[test]
    fn deleted_arrays_are_unknown() {
        let mut engine = Engine::default();
        let c = connect(&mut engine);
        send(&mut engine, CommandKind::Creation, c, 0, &vector(1, 3, 1.0));
        let operation = encode_operation(&[], &dot_tree_of(1, 1, 7));
        send(&mut engine, CommandKind::Operation, c, 1, &operation);

        let mut deletion = Vec::new();
        wire::encode_deletion_list(&[Name(7), Name(7)], &mut deletion);
        assert_eq!(
            send(&mut engine, CommandKind::Deletion, c, 2, &deletion),
            vec![(2, Reply::Deleted)]
        );
        assert_eq!(
            send(&mut engine, CommandKind::Fetch, c, 3, &fetch(7)),
            vec![(3, Reply::Failed(EngineError::UnknownName(Name(7))))]
        );
        // deleting again is fine
        assert_eq!(
            send(&mut engine, CommandKind::Deletion, c, 4, &deletion),
            vec![(4, Reply::Deleted)]
        );
    }

    #[test]
    fn operations_apply_prefixed_deletions_first() {
        let mut engine = Engine::default();
        let c = connect(&mut engine);
        send(&mut engine, CommandKind::Creation, c, 0, &vector(1, 2, 1.0));
        send(&mut engine, CommandKind::Creation, c, 1, &vector(9, 2, 1.0));
        let operation = encode_operation(&[Name(9)], &dot_tree_of(1, 1, 3));
        send(&mut engine, CommandKind::Operation, c, 2, &operation);
        assert!(!engine.store().contains(Name(9)));
        assert!(engine.store().contains(Name(3)));

        // a tree that references a name deleted in the same command fails
        let operation = encode_operation(&[Name(1)], &dot_tree_of(1, 1, 4));
        let replies = send(&mut engine, CommandKind::Operation, c, 3, &operation);
        assert_eq!(replies, vec![(3, Reply::Failed(EngineError::UnknownName(Name(1))))]);
    }

    #[test]
    fn malformed_operation_deletes_nothing() {
        let mut engine = Engine::default();
        let c = connect(&mut engine);
        send(&mut engine, CommandKind::Creation, c, 0, &vector(9, 2, 1.0));

        // a valid deletion prefix followed by a cut-off tree
        let mut operation = encode_operation(&[Name(9)], &dot_tree_of(9, 9, 3));
        operation.truncate(operation.len() - 3);
        let replies = send(&mut engine, CommandKind::Operation, c, 1, &operation);
        assert!(matches!(replies[..], [(1, Reply::Failed(EngineError::ProtocolDecode(_)))]));
        assert!(engine.store().contains(Name(9)));
        assert!(!engine.store().contains(Name(3)));

        // so is one with bytes after the tree
        let mut operation = encode_operation(&[Name(9)], &dot_tree_of(9, 9, 3));
        operation.push(0);
        let replies = send(&mut engine, CommandKind::Operation, c, 2, &operation);
        assert!(matches!(replies[..], [(2, Reply::Failed(EngineError::ProtocolDecode(_)))]));
        assert!(engine.store().contains(Name(9)));
    }

    #[test]
    fn fetch_requires_a_scalar() {
        let mut engine = Engine::default();
        let c = connect(&mut engine);
        send(&mut engine, CommandKind::Creation, c, 0, &vector(1, 2, 1.0));
        let replies = send(&mut engine, CommandKind::Fetch, c, 1, &fetch(1));
        assert!(matches!(replies[0].1, Reply::Failed(EngineError::TypeMismatch(_))));
    }

    #[test]
    fn creation_shapes() {
        let mut engine = Engine::default();
        let c = connect(&mut engine);
        let matrix = Creation {
            name: Name(1),
            dims: vec![2, 2],
            init: Initializer::Buffer(vec![1.0, 2.0, 3.0, 4.0]),
        };
        assert_eq!(
            send(&mut engine, CommandKind::Creation, c, 0, &matrix.encode()),
            vec![(0, Reply::Created)]
        );
        assert_eq!(
            **engine.store().lookup(Name(1)).unwrap(),
            ArrayValue::Matrix(ndarray::array![[1.0, 2.0], [3.0, 4.0]])
        );

        let random = Creation { name: Name(2), dims: vec![16], init: Initializer::Random };
        send(&mut engine, CommandKind::Creation, c, 1, &random.encode());
        match &**engine.store().lookup(Name(2)).unwrap() {
            ArrayValue::Vector(v) => assert!(v.iter().all(|x| (0.0..1.0).contains(x))),
            other => panic!("expected a vector, got {other:?}"),
        }

        for (epoch, dims) in [(2, vec![]), (3, vec![2, 2, 2])] {
            let reply = create(&mut engine, c, epoch, dims, Initializer::Fill(0.0));
            assert!(matches!(reply, Reply::Failed(EngineError::UnsupportedOperation(_))));
        }

        let reply = create(&mut engine, c, 4, vec![1 << 40], Initializer::Fill(0.0));
        assert!(matches!(reply, Reply::Failed(EngineError::ResourceExhausted(_))));
    }

    #[test]
    fn creation_respects_the_element_limit() {
        let config = EngineConfig::builder().max_array_elements(16).build();
        let mut engine: Engine<Tag> = Engine::new(config);
        let c = connect(&mut engine);

        let accepted = [vec![16], vec![4, 4], vec![1, 16], vec![0], vec![0, 3], vec![3, 0]];
        let mut epoch = 0;
        for dims in accepted {
            let reply = create(&mut engine, c, epoch, dims.clone(), Initializer::Fill(1.0));
            assert_eq!(reply, Reply::Created, "shape {dims:?}");
            epoch += 1;
        }

        let refused = [vec![17], vec![4, 5], vec![17, 1], vec![0, 17], vec![17, 0]];
        for dims in refused {
            let reply = create(&mut engine, c, epoch, dims.clone(), Initializer::Fill(1.0));
            assert!(
                matches!(reply, Reply::Failed(EngineError::ResourceExhausted(_))),
                "shape {dims:?} gave {reply:?}"
            );
            epoch += 1;
        }
        assert_eq!(engine.expected_epoch(c), epoch);
    }

    #[test]
    fn empty_axis_does_not_hide_an_unrepresentable_one() {
        let mut engine: Engine<Tag> = Engine::default();
        let c = connect(&mut engine);
        let shapes = [
            vec![0, u64::MAX],
            vec![u64::MAX, 0],
            vec![0, 1 << 63],
            vec![0, isize::MAX as u64],
        ];
        let mut epoch = 0;
        for dims in shapes {
            for init in [Initializer::Fill(0.0), Initializer::Random] {
                let reply = create(&mut engine, c, epoch, dims.clone(), init);
                assert!(
                    matches!(reply, Reply::Failed(EngineError::ResourceExhausted(_))),
                    "shape {dims:?} gave {reply:?}"
                );
                epoch += 1;
            }
        }

        // the engine keeps serving afterwards
        assert_eq!(
            send(&mut engine, CommandKind::Sync, c, epoch, &[]),
            vec![(epoch as Tag, Reply::Synced)]
        );
    }

    #[test]
    fn requests_from_unknown_clients_are_rejected() {
        let mut engine: Engine<Tag> = Engine::default();
        assert_eq!(
            send(&mut engine, CommandKind::Sync, 9, 0, &[]),
            vec![(0, Reply::Failed(EngineError::UnknownClient(9)))]
        );
        let replies = engine.dispatch(&[CommandKind::Sync as u8, 0], 1);
        assert!(matches!(replies[0].1, Reply::Failed(EngineError::ProtocolDecode(_))));
    }

    #[test]
    fn client_ids_are_bounded_and_reused() {
        let mut engine = Engine::default();
        for _ in 0..256 {
            connect(&mut engine);
        }
        let replies = engine.dispatch(&encode_out_of_band(CommandKind::Connect), 0);
        assert!(matches!(replies[0].1, Reply::Failed(EngineError::ResourceExhausted(_))));

        send(&mut engine, CommandKind::Sync, 12, 0, &[]);
        assert_eq!(
            send(&mut engine, CommandKind::Disconnect, 12, 1, &[12]),
            vec![(1, Reply::Disconnected)]
        );
        assert_eq!(connect(&mut engine), 12);
        // the new lease starts its own sequence
        assert_eq!(engine.expected_epoch(12), 0);
        assert_eq!(send(&mut engine, CommandKind::Sync, 12, 0, &[]), vec![(0, Reply::Synced)]);
    }

    #[test]
    fn clients_cannot_disconnect_each_other() {
        let mut engine = Engine::default();
        let a = connect(&mut engine);
        let b = connect(&mut engine);
        let replies = send(&mut engine, CommandKind::Disconnect, a, 0, &[b]);
        assert!(matches!(replies[0].1, Reply::Failed(EngineError::UnsupportedOperation(_))));
        assert!(engine.clients().is_leased(b));
    }

    #[test]
    fn remote_shutdown_is_opt_in() {
        let mut engine: Engine<Tag> = Engine::default();
        let replies = engine.dispatch(&encode_out_of_band(CommandKind::Shutdown), 0);
        assert!(replies[0].1.is_failure());

        let mut engine: Engine<Tag> =
            Engine::new(EngineConfig::builder().allow_remote_shutdown(true).build());
        assert_eq!(
            engine.dispatch(&encode_out_of_band(CommandKind::Shutdown), 0),
            vec![(0, Reply::ShuttingDown)]
        );
    }
}
