//! Replicated log entry codec.
//!
//! An entry is `[4-byte little-endian command type][payload]`, where the
//! payload is the protobuf encoding of the command request.

use prost::Message;

use crate::constants::COMMAND_TAG_LEN;
use crate::proto::AddBlockRequest;
use crate::proto::CleanBlocksRequest;
use crate::proto::CompactionPlanUpdate;
use crate::CodecError;

/// Metadata of the log entry being applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RaftLog {
    pub index: u64,
    pub term: u64,
    /// Time the leader appended the entry, in nanoseconds since the epoch.
    /// Identical on every replica.
    pub appended_at: i64,
}

impl RaftLog {
    pub fn new(
        index: u64,
        term: u64,
        appended_at: i64,
    ) -> Self {
        Self {
            index,
            term,
            appended_at,
        }
    }

    pub fn appended_at_millis(&self) -> i64 {
        self.appended_at / 1_000_000
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u32)]
pub enum CommandType {
    AddBlock = 1,
    UpdateCompactionPlan = 2,
    CleanBlocks = 3,
}

impl CommandType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandType::AddBlock => "add_block",
            CommandType::UpdateCompactionPlan => "update_compaction_plan",
            CommandType::CleanBlocks => "clean_blocks",
        }
    }
}

impl TryFrom<u32> for CommandType {
    type Error = CodecError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(CommandType::AddBlock),
            2 => Ok(CommandType::UpdateCompactionPlan),
            3 => Ok(CommandType::CleanBlocks),
            other => Err(CodecError::UnknownCommand(other)),
        }
    }
}

/// Decoded command. Dispatch over this enum replaces a runtime handler map.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    AddBlock(AddBlockRequest),
    UpdateCompactionPlan(CompactionPlanUpdate),
    CleanBlocks(CleanBlocksRequest),
}

impl Command {
    pub fn command_type(&self) -> CommandType {
        match self {
            Command::AddBlock(_) => CommandType::AddBlock,
            Command::UpdateCompactionPlan(_) => CommandType::UpdateCompactionPlan,
            Command::CleanBlocks(_) => CommandType::CleanBlocks,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let payload = match self {
            Command::AddBlock(r) => r.encode_to_vec(),
            Command::UpdateCompactionPlan(r) => r.encode_to_vec(),
            Command::CleanBlocks(r) => r.encode_to_vec(),
        };
        encode_entry(self.command_type(), &payload)
    }

    pub fn decode(entry: &[u8]) -> Result<Self, CodecError> {
        let (command_type, payload) = decode_entry(entry)?;
        Ok(match command_type {
            CommandType::AddBlock => Command::AddBlock(AddBlockRequest::decode(payload)?),
            CommandType::UpdateCompactionPlan => {
                Command::UpdateCompactionPlan(CompactionPlanUpdate::decode(payload)?)
            }
            CommandType::CleanBlocks => Command::CleanBlocks(CleanBlocksRequest::decode(payload)?),
        })
    }
}

pub fn encode_entry(
    command_type: CommandType,
    payload: &[u8],
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(COMMAND_TAG_LEN + payload.len());
    buf.extend_from_slice(&(command_type as u32).to_le_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Splits an entry into its command type and payload without decoding the
/// payload.
pub fn decode_entry(entry: &[u8]) -> Result<(CommandType, &[u8]), CodecError> {
    if entry.len() < COMMAND_TAG_LEN {
        return Err(CodecError::EntryTooShort { len: entry.len() });
    }
    let (tag, payload) = entry.split_at(COMMAND_TAG_LEN);
    let mut raw = [0u8; COMMAND_TAG_LEN];
    raw.copy_from_slice(tag);
    let command_type = CommandType::try_from(u32::from_le_bytes(raw))?;
    Ok((command_type, payload))
}
