#![forbid(unsafe_code)]

//! Subscribers to heuristics verdicts.

use crate::error::Error;
use crate::exec_result::ExecResult;

pub type NotifierCallback = Box<dyn FnMut(u32, ExecResult) -> Result<(), String> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NotifierId(usize);

struct Notifier {
    name: &'static str,
    active: bool,
    callback: NotifierCallback,
}

/// Callbacks invoked in registration order for every accepted result.
#[derive(Default)]
pub struct ResultNotifierList {
    items: Vec<Notifier>,
}

impl ResultNotifierList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` under `name`, inactive. Registering a name twice
    /// returns the existing id and keeps the first callback.
    pub fn add(&mut self, name: &'static str, callback: NotifierCallback) -> NotifierId {
        if let Some(id) = self.get(name) {
            return id;
        }

        self.items.push(Notifier {
            name,
            active: false,
            callback,
        });
        NotifierId(self.items.len() - 1)
    }

    pub fn get(&self, name: &str) -> Option<NotifierId> {
        self.items
            .iter()
            .position(|item| item.name == name)
            .map(NotifierId)
    }

    pub fn set_active(&mut self, id: NotifierId, active: bool) -> Result<(), Error> {
        let item = self.items.get_mut(id.0).ok_or(Error::UnknownNotifier)?;
        item.active = active;
        Ok(())
    }

    pub fn is_active(&self, id: NotifierId) -> bool {
        self.items.get(id.0).is_some_and(|item| item.active)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Call every active callback. Stops at the first failure.
    pub fn notify(&mut self, seq: u32, result: ExecResult) -> Result<(), Error> {
        for item in self.items.iter_mut().filter(|item| item.active) {
            (item.callback)(seq, result).map_err(|reason| Error::Notifier {
                name: item.name,
                seq,
                result,
                reason,
            })?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for ResultNotifierList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.items.iter().map(|item| (item.name, item.active)))
            .finish()
    }
}
