use std::sync::Arc;

use hashbrown::HashMap;

use super::{Dependency, PARAM_DEF};
use crate::{
    checkpoint::{Checkpoint, Reader, Writer},
    error::Error,
    id::GlobalId,
    runtime::Scope,
};

/// A task body. Returns the id delivered to the task's post-slots.
pub type TaskFn =
    Arc<dyn Fn(&mut Scope<'_>, &[u64], &[Dependency]) -> Result<GlobalId, Error> + Send + Sync>;

/// Immutable description of a kind of task. Bodies are referenced by
/// registry index so that templates can travel between nodes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskTemplate {
    pub id: GlobalId,
    pub function: u32,
    pub paramc: u32,
    pub depc: u32,
    pub name: String,
}

impl TaskTemplate {
    /// Replaces `PARAM_DEF` counts with the template's own.
    pub fn counts(&self, paramc: u32, depc: u32) -> (u32, u32) {
        let pick = |given, default| if given == PARAM_DEF { default } else { given };
        (pick(paramc, self.paramc), pick(depc, self.depc))
    }
}

impl Checkpoint for TaskTemplate {
    fn save<W: Writer>(&self, w: &mut W) {
        self.id.save(w);
        w.write_value("function", u64::from(self.function));
        w.write_value("paramc", u64::from(self.paramc));
        w.write_value("depc", u64::from(self.depc));
        w.write_bytes("name", self.name.as_bytes());
    }

    fn load<R: Reader>(r: &mut R) -> Result<Self, Error> {
        Ok(Self {
            id: GlobalId::load(r)?,
            function: r.read_u32("function")?,
            paramc: r.read_u32("paramc")?,
            depc: r.read_u32("depc")?,
            name: String::from_utf8(r.read_bytes("name")?)
                .map_err(|_| Error::Checkpoint("template name is not utf-8".into()))?,
        })
    }
}

/// Task bodies known to every node, registered in the same order
/// everywhere before the cluster starts.
#[derive(Clone, Default)]
pub struct Registry {
    names: HashMap<String, u32>,
    functions: Vec<(String, TaskFn)>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `body` under `name`, replacing an earlier body of the same
    /// name, and returns its index.
    pub fn register<F>(&mut self, name: impl Into<String>, body: F) -> u32
    where
        F: Fn(&mut Scope<'_>, &[u64], &[Dependency]) -> Result<GlobalId, Error>
            + Send
            + Sync
            + 'static,
    {
        let name = name.into();
        let body: TaskFn = Arc::new(body);
        if let Some(&index) = self.names.get(&name) {
            self.functions[index as usize].1 = body;
            return index;
        }
        let index = self.functions.len() as u32;
        self.names.insert(name.clone(), index);
        self.functions.push((name, body));
        index
    }

    pub fn index(&self, name: &str) -> Result<u32, Error> {
        self.names
            .get(name)
            .copied()
            .ok_or_else(|| Error::UnknownFunction(name.to_owned()))
    }

    pub fn get(&self, index: u32) -> Result<TaskFn, Error> {
        self.functions
            .get(index as usize)
            .map(|(_, body)| body.clone())
            .ok_or_else(|| Error::UnknownFunction(format!("#{}", index)))
    }

    pub fn name(&self, index: u32) -> Option<&str> {
        self.functions.get(index as usize).map(|(name, _)| name.as_str())
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

impl core::fmt::Debug for Registry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_list().entries(self.functions.iter().map(|(name, _)| name)).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_assigns_stable_indices() {
        let mut registry = Registry::new();
        let a = registry.register("a", |_, _, _| Ok(GlobalId::NULL));
        let b = registry.register("b", |_, _, _| Ok(GlobalId::NULL));
        assert_eq!((a, b), (0, 1));
        assert_eq!(registry.register("a", |_, _, _| Ok(GlobalId::NULL)), 0);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.index("b").unwrap(), 1);
        assert_eq!(registry.name(1), Some("b"));
        assert!(matches!(registry.index("c"), Err(Error::UnknownFunction(_))));
        assert!(registry.get(7).is_err());
    }

    #[test]
    fn test_default_counts_come_from_template() {
        let template = TaskTemplate {
            id: GlobalId::direct(0, 2),
            function: 0,
            paramc: 3,
            depc: 2,
            name: "t".into(),
        };
        assert_eq!(template.counts(PARAM_DEF, PARAM_DEF), (3, 2));
        assert_eq!(template.counts(1, 0), (1, 0));
    }
}
