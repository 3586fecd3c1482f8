// [libs/domain/models/src/lib.rs]
//! Domain contracts shared between the server and the agent.
//!
//! Everything that crosses the wire or the database boundary is defined here
//! so both binaries agree on one schema: the message envelope and its closed
//! tag set, the job/task/agent/hash entities, binary-version patterns, and
//! the external cracker's JSON status document.

pub mod agent;
pub mod benchmark;
pub mod binary_pattern;
pub mod config;
pub mod file;
pub mod hash;
pub mod hashcat;
pub mod job;
pub mod messages;
pub mod task;

#[cfg(test)]
mod tests_serialization;

pub use agent::{Agent, AgentStatus, Device, SyncStatus};
pub use benchmark::{AgentBenchmark, NO_SALT_SENTINEL};
pub use binary_pattern::{BinaryPattern, BinaryRelease, BinaryVersion, PatternError};
pub use config::AgentTimingConfig;
pub use file::{AgentFileEntry, FileInfo, FileType};
pub use hash::{Hash, Hashlist, LmMetadata, LM_BLANK_HALF, LM_HASH_TYPE};
pub use hashcat::{HashcatDeviceStatus, HashcatStatus, STATUS_ALL_CRACKED, STATUS_EXHAUSTED};
pub use job::{AttackMode, IncrementLayer, IncrementMode, JobExecution, JobStatus};
pub use messages::{Envelope, MessageType, ProtocolError};
pub use task::{JobTask, TaskStatus};
