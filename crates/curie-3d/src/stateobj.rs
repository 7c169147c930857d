//! Immutable hardware state objects
//!
//! A [`StateObject`] is a pre-built fragment of command-stream data for one
//! state category. Objects are shared behind `Rc` and compared by identity
//! at emission time; value equality is only used at validation time to
//! decide whether a rebuilt fragment actually differs from the cached one.

use std::rc::Rc;

use crate::pushbuf::{PushBuffer, RelocFlags};

/// One recorded command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoCmd {
    Method { method: u32, count: u32 },
    Data(u32),
    Reloc(u32, RelocFlags),
}

/// Immutable command fragment for one state category
#[derive(Debug, PartialEq, Eq)]
pub struct StateObject {
    cmds: Vec<SoCmd>,
}

impl StateObject {
    /// Replay the fragment into the outgoing stream
    pub fn replay(&self, pb: &mut dyn PushBuffer) {
        for cmd in &self.cmds {
            match *cmd {
                SoCmd::Method { method, count } => pb.begin_method(method, count),
                SoCmd::Data(word) => pb.append_data(word),
                SoCmd::Reloc(word, flags) => pb.append_relocated(word, flags),
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.cmds.is_empty()
    }
}

/// Builder for [`StateObject`]s
#[derive(Debug, Default)]
pub struct StateObjectBuilder {
    cmds: Vec<SoCmd>,
}

impl StateObjectBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn method(&mut self, method: u32, count: u32) -> &mut Self {
        self.cmds.push(SoCmd::Method { method, count });
        self
    }

    pub fn data(&mut self, word: u32) -> &mut Self {
        self.cmds.push(SoCmd::Data(word));
        self
    }

    pub fn data_f32(&mut self, value: f32) -> &mut Self {
        self.data(value.to_bits())
    }

    pub fn reloc(&mut self, word: u32, flags: RelocFlags) -> &mut Self {
        self.cmds.push(SoCmd::Reloc(word, flags));
        self
    }

    pub fn build(self) -> Rc<StateObject> {
        Rc::new(StateObject { cmds: self.cmds })
    }

    /// Build, but reuse `cached` when the rebuilt fragment is value-equal.
    /// Returns `(object, changed)`.
    pub fn build_or_keep(self, cached: Option<&Rc<StateObject>>) -> (Rc<StateObject>, bool) {
        match cached {
            Some(old) if old.cmds == self.cmds => (Rc::clone(old), false),
            _ => (self.build(), true),
        }
    }
}
