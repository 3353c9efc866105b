use arrayref::array_ref;
use byteorder::{ByteOrder, LittleEndian};

use crate::{
    block::{AccessMode, BlockMessage, ReplicaState},
    checkpoint::{Checkpoint, Reader, Writer},
    directory::ObjectKind,
    error::Error,
    graph::{event::EventKind, template::TaskTemplate},
    id::{GlobalId, NodeId},
};

/// Generic 64-bit fields carried by every header.
pub const FIELD_COUNT: usize = 10;

/// cmd (1) | from (4) | to (4) | sender (8) | id (8) | fields (10 * 8)
pub const HEADER_LEN: usize = 1 + 4 + 4 + 8 + 8 + FIELD_COUNT * 8;

/// Every command a node understands. The discriminant is the wire code.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Command {
    Invalid,
    Confirmation,

    // CONTROL
    Pause,
    Paused,
    Resume,
    StartFlush,
    Flushed,
    Flush,
    Reflush,
    Save,
    Saved,
    Load,
    Loaded,
    /// Stops the receiver that reads it. Never leaves the cluster harness.
    Exit,
    Shutdown,

    // DIRECTORY
    PushEdtTemplate,
    PushDb,
    PushProxy,
    PullObject,

    // GRAPH
    EdtCreate,
    EdtStartTrivial,
    DbCreate,
    MappedDbCreate,
    EventDestroy,
    DbDestroy,
    AddPreslot,
    AddPostslot,
    SatisfyPreslot,
    SatisfyPreslotWithData,
    MappedEventCreate,

    // REPLICATION
    DbElevationRequest,
    DbReleaseMasterRequest,
    DbCopylistReleased,
    DbTakeMaster,
    DbTransferDataToNewMaster,
    DbTransferDataToCopy,
    DbData,
    DbDataCopy,
    DbCopyReceived,
    DbIsMaster,
    DbInvalidateCopy,
    DbCopyInvalidated,

    // ID ALLOCATION
    AllocateGuid,
    AllocatedGuid,
    AllocateMapId,
    AllocatedMapId,

    Barrier,
    BarrierDone,
}

impl Command {
    const ALL: [Command; 48] = {
        use Command::*;
        [
            Invalid,
            Confirmation,
            Pause,
            Paused,
            Resume,
            StartFlush,
            Flushed,
            Flush,
            Reflush,
            Save,
            Saved,
            Load,
            Loaded,
            Exit,
            Shutdown,
            PushEdtTemplate,
            PushDb,
            PushProxy,
            PullObject,
            EdtCreate,
            EdtStartTrivial,
            DbCreate,
            MappedDbCreate,
            EventDestroy,
            DbDestroy,
            AddPreslot,
            AddPostslot,
            SatisfyPreslot,
            SatisfyPreslotWithData,
            MappedEventCreate,
            DbElevationRequest,
            DbReleaseMasterRequest,
            DbCopylistReleased,
            DbTakeMaster,
            DbTransferDataToNewMaster,
            DbTransferDataToCopy,
            DbData,
            DbDataCopy,
            DbCopyReceived,
            DbIsMaster,
            DbInvalidateCopy,
            DbCopyInvalidated,
            AllocateGuid,
            AllocatedGuid,
            AllocateMapId,
            AllocatedMapId,
            Barrier,
            BarrierDone,
        ]
    };

    /// When the next message of the same sending task may follow this one.
    pub fn confirmation(self) -> Confirmation {
        use Command as C;
        match self {
            C::Confirmation | C::Pause | C::Paused | C::Resume | C::StartFlush
            | C::Flushed | C::Flush | C::Reflush | C::Save | C::Saved
            | C::Load | C::Loaded | C::Exit | C::PullObject | C::Barrier
            | C::BarrierDone => Confirmation::Special,
            C::PushEdtTemplate | C::PushDb | C::PushProxy | C::EdtStartTrivial
            | C::DbCreate | C::MappedDbCreate | C::EventDestroy | C::DbDestroy
            | C::MappedEventCreate => Confirmation::Single,
            C::AddPreslot | C::AddPostslot | C::SatisfyPreslot
            | C::SatisfyPreslotWithData => Confirmation::Forward,
            C::EdtCreate => Confirmation::Task,
            _ => Confirmation::None,
        }
    }

    /// Control traffic is still handled while a node is paused.
    pub fn is_control(self) -> bool {
        use Command::*;
        matches!(
            self,
            Pause
                | Paused
                | Resume
                | StartFlush
                | Flushed
                | Flush
                | Reflush
                | Save
                | Saved
                | Load
                | Loaded
                | Barrier
                | BarrierDone
        )
    }

    pub fn is_replication(self) -> bool {
        (Command::DbElevationRequest as u8..=Command::DbCopyInvalidated as u8)
            .contains(&(self as u8))
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub const COUNT: usize = Self::ALL.len();
}

impl TryFrom<u8> for Command {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Command::ALL
            .get(value as usize)
            .copied()
            .ok_or(Error::UnknownCommand(value))
    }
}

/// Confirmation discipline of a command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Confirmation {
    /// Fire and forget.
    None,
    /// Fire and forget; handled outside the task graph.
    Special,
    /// The receiver confirms once the handler is done, and the handler may
    /// not send anything.
    Single,
    /// The confirmation travels with whatever the handler sends next.
    Forward,
    /// The handler becomes a sending task of its own; the confirmation
    /// follows everything it sent.
    Task,
}

impl Confirmation {
    pub fn auto_confirms(self) -> bool {
        matches!(self, Confirmation::None | Confirmation::Special)
    }
}

/// A decoded message. `sender` is the task on `from` that owns the message
/// and `id` its position in that task's sequence.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub command: Command,
    pub from: NodeId,
    pub to: NodeId,
    pub sender: GlobalId,
    pub id: u64,
    pub a: [u64; FIELD_COUNT],
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(command: Command, to: NodeId) -> Self {
        Self {
            command,
            from: 0,
            to,
            sender: GlobalId::NULL,
            id: 0,
            a: [0; FIELD_COUNT],
            payload: Vec::new(),
        }
    }

    fn field(mut self, index: usize, value: impl Into<u64>) -> Self {
        self.a[index] = value.into();
        self
    }

    fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    pub fn id_at(&self, index: usize) -> GlobalId {
        GlobalId::from_u64(self.a[index])
    }

    pub fn u32_at(&self, index: usize) -> u32 {
        self.a[index] as u32
    }

    /// Trailing payload length implied by the header.
    pub fn payload_len(&self) -> Result<usize, Error> {
        let a = &self.a;
        let len = match self.command {
            Command::PushEdtTemplate => a[4],
            Command::EdtCreate => a[5]
                .checked_add(a[6])
                .ok_or(Error::MalformedMessage("payload length overflowed"))?,
            Command::SatisfyPreslotWithData => a[2],
            Command::DbCopylistReleased | Command::DbTakeMaster => a[1]
                .checked_mul(8)
                .ok_or(Error::MalformedMessage("payload length overflowed"))?,
            Command::DbData | Command::DbDataCopy => a[1],
            _ => 0,
        };
        usize::try_from(len)
            .map_err(|_| Error::MalformedMessage("payload length overflowed"))
    }

    /// Objects that must be resolvable on the receiver before dispatch.
    pub fn objects_needed(&self) -> Vec<GlobalId> {
        match self.command {
            Command::EdtCreate => vec![self.id_at(0)],
            _ => Vec::new(),
        }
    }

    /// Objects the receiver fetches into its cache before dispatch.
    pub fn objects_to_fetch(&self) -> Vec<GlobalId> {
        match self.command {
            Command::SatisfyPreslot => vec![self.id_at(0)],
            _ => Vec::new(),
        }
    }

    /// Objects the handler brings into existence.
    pub fn objects_created(&self) -> Vec<GlobalId> {
        match self.command {
            Command::EdtCreate => vec![self.id_at(7), self.id_at(8)],
            Command::DbCreate | Command::MappedDbCreate | Command::MappedEventCreate => {
                vec![self.id_at(0)]
            }
            _ => Vec::new(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; HEADER_LEN + self.payload.len()];
        buf[0] = self.command as u8;
        LittleEndian::write_u32(&mut buf[1..5], self.from);
        LittleEndian::write_u32(&mut buf[5..9], self.to);
        LittleEndian::write_u64(&mut buf[9..17], self.sender.as_u64());
        LittleEndian::write_u64(&mut buf[17..25], self.id);
        LittleEndian::write_u64_into(&self.a, &mut buf[25..HEADER_LEN]);
        buf[HEADER_LEN..].copy_from_slice(&self.payload);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < HEADER_LEN {
            return Err(Error::MessageLengthMismatch {
                expected: HEADER_LEN,
                actual: bytes.len(),
            });
        }
        let header = array_ref![bytes, 0, HEADER_LEN];
        let mut a = [0u64; FIELD_COUNT];
        LittleEndian::read_u64_into(&header[25..HEADER_LEN], &mut a);
        let mut msg = Self {
            command: Command::try_from(header[0])?,
            from: LittleEndian::read_u32(array_ref![header, 1, 4]),
            to: LittleEndian::read_u32(array_ref![header, 5, 4]),
            sender: GlobalId::from_u64(LittleEndian::read_u64(array_ref![
                header, 9, 8
            ])),
            id: LittleEndian::read_u64(array_ref![header, 17, 8]),
            a,
            payload: Vec::new(),
        };
        let expected = HEADER_LEN + msg.payload_len()?;
        if bytes.len() != expected {
            return Err(Error::MessageLengthMismatch {
                expected,
                actual: bytes.len(),
            });
        }
        msg.payload = bytes[HEADER_LEN..].to_vec();
        Ok(msg)
    }
}

/// Everything `edt_create` carries.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EdtCreate {
    pub template: GlobalId,
    pub params: Vec<u64>,
    pub depc: u32,
    pub deps: Option<Vec<GlobalId>>,
    pub properties: u16,
    pub affinity: GlobalId,
    pub task: GlobalId,
    pub event: GlobalId,
    pub parent_finish: GlobalId,
}

fn words_to_bytes(words: impl Iterator<Item = u64>, out: &mut Vec<u8>) {
    for word in words {
        out.extend_from_slice(&word.to_le_bytes());
    }
}

fn bytes_to_words(bytes: &[u8]) -> Vec<u64> {
    bytes.chunks_exact(8).map(LittleEndian::read_u64).collect()
}

impl Message {
    pub fn confirmation(to: NodeId, task: GlobalId, id: u64) -> Self {
        Self::new(Command::Confirmation, to).field(0, task).field(1, id)
    }

    pub fn control(command: Command, to: NodeId) -> Self {
        Self::new(command, to)
    }

    pub fn flush(to: NodeId, initiator: NodeId) -> Self {
        Self::new(Command::Flush, to).field(0, initiator)
    }

    pub fn push_edt_template(to: NodeId, template: &TaskTemplate) -> Self {
        let name = template.name.as_bytes().to_vec();
        Self::new(Command::PushEdtTemplate, to)
            .field(0, template.id)
            .field(1, template.function)
            .field(2, template.paramc)
            .field(3, template.depc)
            .field(4, name.len() as u64)
            .with_payload(name)
    }

    /// The template a `push_edt_template` carries.
    pub fn template(&self) -> Result<TaskTemplate, Error> {
        let name = String::from_utf8(self.payload.clone())
            .map_err(|_| Error::MalformedMessage("template name is not utf-8"))?;
        Ok(TaskTemplate {
            id: self.id_at(0),
            function: self.u32_at(1),
            paramc: self.u32_at(2),
            depc: self.u32_at(3),
            name,
        })
    }

    pub fn push_db(to: NodeId, id: GlobalId, len: u64, allocator: u64) -> Self {
        Self::new(Command::PushDb, to)
            .field(0, id)
            .field(1, len)
            .field(2, allocator)
    }

    pub fn push_proxy(to: NodeId, id: GlobalId, kind: ObjectKind) -> Self {
        Self::new(Command::PushProxy, to)
            .field(0, id)
            .field(1, kind as u8)
    }

    pub fn pull_object(to: NodeId, id: GlobalId) -> Self {
        Self::new(Command::PullObject, to).field(0, id)
    }

    pub fn edt_create(to: NodeId, create: &EdtCreate) -> Self {
        let mut payload = Vec::new();
        words_to_bytes(create.params.iter().copied(), &mut payload);
        let param_bytes = payload.len() as u64;
        if let Some(deps) = &create.deps {
            words_to_bytes(deps.iter().map(|d| d.as_u64()), &mut payload);
        }
        let dep_bytes = payload.len() as u64 - param_bytes;
        Self::new(Command::EdtCreate, to)
            .field(0, create.template)
            .field(1, create.params.len() as u64)
            .field(2, create.depc)
            .field(3, create.properties)
            .field(4, create.affinity)
            .field(5, param_bytes)
            .field(6, dep_bytes)
            .field(7, create.task)
            .field(8, create.event)
            .field(9, create.parent_finish)
            .with_payload(payload)
    }

    pub fn edt_create_fields(&self) -> EdtCreate {
        let param_bytes = self.a[5] as usize;
        let params = bytes_to_words(&self.payload[..param_bytes]);
        let deps = if self.a[6] > 0 {
            Some(
                bytes_to_words(&self.payload[param_bytes..])
                    .into_iter()
                    .map(GlobalId::from_u64)
                    .collect(),
            )
        } else {
            None
        };
        EdtCreate {
            template: self.id_at(0),
            params,
            depc: self.u32_at(2),
            deps,
            properties: self.a[3] as u16,
            affinity: self.id_at(4),
            task: self.id_at(7),
            event: self.id_at(8),
            parent_finish: self.id_at(9),
        }
    }

    pub fn edt_start_trivial(to: NodeId, task: GlobalId) -> Self {
        Self::new(Command::EdtStartTrivial, to).field(0, task)
    }

    pub fn db_create(
        to: NodeId,
        id: GlobalId,
        len: u64,
        flags: u16,
        allocator: u64,
    ) -> Self {
        Self::new(Command::DbCreate, to)
            .field(0, id)
            .field(1, len)
            .field(2, flags)
            .field(3, GlobalId::node_hint(to))
            .field(4, allocator)
    }

    pub fn mapped_db_create(
        to: NodeId,
        id: GlobalId,
        len: u64,
        flags: u16,
        allocator: u64,
        master: NodeId,
    ) -> Self {
        Self::new(Command::MappedDbCreate, to)
            .field(0, id)
            .field(1, len)
            .field(2, flags)
            .field(3, GlobalId::node_hint(master))
            .field(4, allocator)
            .field(5, master)
    }

    pub fn event_destroy(to: NodeId, id: GlobalId) -> Self {
        Self::new(Command::EventDestroy, to).field(0, id)
    }

    pub fn db_destroy(to: NodeId, id: GlobalId) -> Self {
        Self::new(Command::DbDestroy, to).field(0, id)
    }

    pub fn add_preslot(
        to: NodeId,
        source: GlobalId,
        destination: GlobalId,
        slot: u32,
        mode: AccessMode,
    ) -> Self {
        Self::new(Command::AddPreslot, to)
            .field(0, source)
            .field(1, destination)
            .field(2, slot)
            .field(3, mode as u8)
    }

    pub fn add_postslot(
        to: NodeId,
        source: GlobalId,
        destination: GlobalId,
        slot: u32,
        mode: AccessMode,
    ) -> Self {
        Self::new(Command::AddPostslot, to)
            .field(0, source)
            .field(1, destination)
            .field(2, slot)
            .field(3, mode as u8)
    }

    pub fn satisfy_preslot(
        to: NodeId,
        data: GlobalId,
        destination: GlobalId,
        slot: u32,
    ) -> Self {
        Self::new(Command::SatisfyPreslot, to)
            .field(0, data)
            .field(1, destination)
            .field(2, slot)
    }

    pub fn satisfy_preslot_with_data(
        to: NodeId,
        destination: GlobalId,
        slot: u32,
        mode: AccessMode,
        data: Vec<u8>,
    ) -> Self {
        Self::new(Command::SatisfyPreslotWithData, to)
            .field(0, destination)
            .field(1, slot)
            .field(2, data.len() as u64)
            .field(3, mode as u8)
            .with_payload(data)
    }

    pub fn mapped_event_create(
        to: NodeId,
        id: GlobalId,
        kind: EventKind,
        properties: u16,
        latch_initial: u64,
        allow_concurrent: bool,
    ) -> Self {
        Self::new(Command::MappedEventCreate, to)
            .field(0, id)
            .field(1, kind as u8)
            .field(2, properties)
            .field(3, latch_initial)
            .field(4, allow_concurrent)
    }

    pub fn allocate_guid(to: NodeId) -> Self {
        Self::new(Command::AllocateGuid, to)
    }

    pub fn allocated_guid(to: NodeId, first: GlobalId, count: u32) -> Self {
        Self::new(Command::AllocatedGuid, to)
            .field(0, first)
            .field(1, count)
    }

    pub fn allocate_map_id(to: NodeId) -> Self {
        Self::new(Command::AllocateMapId, to)
    }

    pub fn allocated_map_id(to: NodeId, map: u32) -> Self {
        Self::new(Command::AllocatedMapId, to).field(0, map)
    }

    /// Wraps a replication protocol message for `block`.
    pub fn block(to: NodeId, block: GlobalId, msg: BlockMessage) -> Self {
        use BlockMessage::*;
        let base = |command| Self::new(command, to).field(0, block);
        let nodes = |list: Vec<NodeId>| {
            let mut payload = Vec::with_capacity(list.len() * 8);
            words_to_bytes(list.iter().map(|n| u64::from(*n)), &mut payload);
            (list.len() as u64, payload)
        };
        match msg {
            ElevationRequest { node, level } => base(Command::DbElevationRequest)
                .field(1, node)
                .field(2, level as u8),
            ReleaseMasterRequest => base(Command::DbReleaseMasterRequest),
            CopylistReleased(list) => {
                let (count, payload) = nodes(list);
                base(Command::DbCopylistReleased)
                    .field(1, count)
                    .with_payload(payload)
            }
            TakeMaster(list) => {
                let (count, payload) = nodes(list);
                base(Command::DbTakeMaster).field(1, count).with_payload(payload)
            }
            TransferDataToNewMaster { recipient } => {
                base(Command::DbTransferDataToNewMaster).field(1, recipient)
            }
            TransferDataToCopy { recipient } => {
                base(Command::DbTransferDataToCopy).field(1, recipient)
            }
            Data(data) => base(Command::DbData)
                .field(1, data.len() as u64)
                .with_payload(data),
            DataCopy(data) => base(Command::DbDataCopy)
                .field(1, data.len() as u64)
                .with_payload(data),
            CopyReceived => base(Command::DbCopyReceived),
            IsMaster => base(Command::DbIsMaster),
            InvalidateCopy => base(Command::DbInvalidateCopy),
            CopyInvalidated => base(Command::DbCopyInvalidated),
        }
    }

    /// The replication message this wraps and the block it addresses.
    pub fn block_message(self) -> Result<(GlobalId, BlockMessage), Error> {
        use BlockMessage::*;
        let block = self.id_at(0);
        let nodes = |payload: &[u8]| {
            bytes_to_words(payload).into_iter().map(|n| n as NodeId).collect()
        };
        let msg = match self.command {
            Command::DbElevationRequest => ElevationRequest {
                node: self.u32_at(1),
                level: ReplicaState::try_from(self.a[2] as u8)?,
            },
            Command::DbReleaseMasterRequest => ReleaseMasterRequest,
            Command::DbCopylistReleased => CopylistReleased(nodes(&self.payload)),
            Command::DbTakeMaster => TakeMaster(nodes(&self.payload)),
            Command::DbTransferDataToNewMaster => TransferDataToNewMaster {
                recipient: self.u32_at(1),
            },
            Command::DbTransferDataToCopy => TransferDataToCopy {
                recipient: self.u32_at(1),
            },
            Command::DbData => Data(self.payload),
            Command::DbDataCopy => DataCopy(self.payload),
            Command::DbCopyReceived => CopyReceived,
            Command::DbIsMaster => IsMaster,
            Command::DbInvalidateCopy => InvalidateCopy,
            Command::DbCopyInvalidated => CopyInvalidated,
            _ => return Err(Error::MalformedMessage("not a replication message")),
        };
        Ok((block, msg))
    }
}

impl Checkpoint for Message {
    fn save<W: Writer>(&self, w: &mut W) {
        w.write_bytes("message", &self.encode());
    }

    fn load<R: Reader>(r: &mut R) -> Result<Self, Error> {
        Message::decode(&r.read_bytes("message")?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_codes_are_dense() {
        for (code, command) in Command::ALL.iter().enumerate() {
            assert_eq!(*command as usize, code);
            assert_eq!(Command::try_from(code as u8).unwrap(), *command);
        }
        assert!(matches!(
            Command::try_from(Command::COUNT as u8),
            Err(Error::UnknownCommand(_))
        ));
    }

    #[test]
    fn test_confirmation_kinds() {
        assert_eq!(Command::EdtCreate.confirmation(), Confirmation::Task);
        assert_eq!(Command::AddPreslot.confirmation(), Confirmation::Forward);
        assert_eq!(Command::DbCreate.confirmation(), Confirmation::Single);
        assert_eq!(Command::DbData.confirmation(), Confirmation::None);
        assert_eq!(Command::Shutdown.confirmation(), Confirmation::None);
        assert_eq!(Command::Barrier.confirmation(), Confirmation::Special);
        assert!(Command::DbElevationRequest.is_replication());
        assert!(Command::DbCopyInvalidated.is_replication());
        assert!(!Command::AllocateGuid.is_replication());
    }

    #[test]
    fn test_header_layout() {
        let mut msg = Message::satisfy_preslot(2, GlobalId::direct(1, 7), GlobalId::direct(2, 3), 4);
        msg.from = 1;
        msg.sender = GlobalId::direct(1, 0);
        msg.id = 9;
        let bytes = msg.encode();
        assert_eq!(bytes.len(), HEADER_LEN);
        assert_eq!(bytes[0], Command::SatisfyPreslot as u8);
        assert_eq!(LittleEndian::read_u32(&bytes[5..9]), 2);
        assert_eq!(LittleEndian::read_u64(&bytes[17..25]), 9);
        assert_eq!(Message::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_payload_length_comes_from_header() {
        let msg = Message::satisfy_preslot_with_data(
            0,
            GlobalId::direct(0, 5),
            1,
            AccessMode::Ro,
            b"hello".to_vec(),
        );
        let mut bytes = msg.encode();
        assert_eq!(Message::decode(&bytes).unwrap().payload, b"hello");
        bytes.push(0);
        assert!(matches!(
            Message::decode(&bytes),
            Err(Error::MessageLengthMismatch { expected, actual })
                if expected == HEADER_LEN + 5 && actual == HEADER_LEN + 6
        ));
        assert!(Message::decode(&bytes[..HEADER_LEN - 1]).is_err());
    }

    #[test]
    fn test_edt_create_fields() {
        let create = EdtCreate {
            template: GlobalId::direct(0, 2),
            params: vec![7, 8, 9],
            depc: 2,
            deps: Some(vec![GlobalId::NULL, GlobalId::direct(1, 4)]),
            properties: 1,
            affinity: GlobalId::node_hint(1),
            task: GlobalId::direct(1, 10),
            event: GlobalId::direct(1, 11),
            parent_finish: GlobalId::NULL,
        };
        let msg = Message::decode(&Message::edt_create(1, &create).encode()).unwrap();
        assert_eq!(msg.edt_create_fields(), create);
        assert_eq!(msg.objects_needed(), vec![create.template]);
        assert_eq!(msg.objects_created(), vec![create.task, create.event]);
    }

    #[test]
    fn test_edt_create_without_dependency_list() {
        let create = EdtCreate {
            template: GlobalId::direct(0, 2),
            params: Vec::new(),
            depc: 3,
            deps: None,
            properties: 0,
            affinity: GlobalId::NULL,
            task: GlobalId::direct(0, 10),
            event: GlobalId::direct(0, 11),
            parent_finish: GlobalId::NULL,
        };
        let msg = Message::edt_create(0, &create);
        assert!(msg.payload.is_empty());
        assert_eq!(msg.edt_create_fields(), create);
    }

    #[test]
    fn test_copylist_travels_in_payload() {
        let msg = Message::block(0, GlobalId::direct(0, 3), BlockMessage::TakeMaster(vec![2, 1]));
        let decoded = Message::decode(&msg.encode()).unwrap();
        assert_eq!(decoded.payload.len(), 16);
        let (block, inner) = decoded.block_message().unwrap();
        assert_eq!(block, GlobalId::direct(0, 3));
        assert_eq!(inner, BlockMessage::TakeMaster(vec![2, 1]));
    }
}
