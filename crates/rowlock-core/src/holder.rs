//! Holder identity: which process instance and which caller owns a lock.
//!
//! A holder is written to the lock record as `instanceId:owner`. Reentrancy is
//! granted per holder, so two different owners inside the same process are
//! competitors just like two different processes.

use std::fmt;
use std::thread::ThreadId;

use uuid::Uuid;

/// Identifies one running process instance for the lifetime of its lock client.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceId(String);

impl InstanceId {
    /// Generates a fresh random identity.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Builds the holder string stored in lock records for `owner`.
    pub fn holder_for(&self, owner: &OwnerId) -> String {
        format!("{}:{}", self.0, owner)
    }
}

impl From<String> for InstanceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The unit of reentrancy inside a process.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OwnerId {
    /// A tokio task.
    Task(tokio::task::Id),
    /// An OS thread outside any tokio task.
    Thread(ThreadId),
    /// A caller-supplied identity, e.g. a request or worker id.
    Named(String),
}

impl OwnerId {
    /// The identity of the code calling this: the current tokio task when there
    /// is one, otherwise the current OS thread.
    pub fn current() -> Self {
        match tokio::task::try_id() {
            Some(id) => OwnerId::Task(id),
            None => OwnerId::Thread(std::thread::current().id()),
        }
    }

    pub fn named(name: impl Into<String>) -> Self {
        OwnerId::Named(name.into())
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OwnerId::Task(id) => write!(f, "task-{id}"),
            OwnerId::Thread(id) => write!(f, "{id:?}"),
            OwnerId::Named(name) => f.write_str(name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn holder_joins_instance_and_owner() {
        let instance = InstanceId::from("3f2a".to_string());
        assert_eq!(
            instance.holder_for(&OwnerId::named("worker-7")),
            "3f2a:worker-7"
        );
    }

    #[test]
    fn generated_instances_differ() {
        assert_ne!(InstanceId::generate(), InstanceId::generate());
        assert_eq!(InstanceId::generate().as_str().len(), 32);
    }

    #[test]
    fn outside_a_task_the_thread_is_the_owner() {
        assert_eq!(
            OwnerId::current(),
            OwnerId::Thread(std::thread::current().id())
        );
    }

    #[tokio::test]
    async fn spawned_tasks_are_distinct_owners() {
        let a = tokio::spawn(async { OwnerId::current() }).await.unwrap();
        let b = tokio::spawn(async { OwnerId::current() }).await.unwrap();
        assert!(matches!(a, OwnerId::Task(_)));
        assert_ne!(a, b);
    }
}
