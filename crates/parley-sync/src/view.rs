use std::collections::{HashMap, HashSet};

use uuid::Uuid;

/// Presentation-only state for one message. Never written to the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessageFlags {
    pub reaction_picker_open: bool,
    pub editing: bool,
    pub hovered: bool,
}

impl MessageFlags {
    fn is_default(&self) -> bool {
        *self == Self::default()
    }
}

/// Side table of [`MessageFlags`] keyed by message id.
#[derive(Debug, Clone, Default)]
pub struct ViewFlags {
    flags: HashMap<Uuid, MessageFlags>,
}

impl ViewFlags {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flags for `id`, all false if never set.
    pub fn get(&self, id: Uuid) -> MessageFlags {
        self.flags.get(&id).copied().unwrap_or_default()
    }

    pub fn get_mut(&mut self, id: Uuid) -> &mut MessageFlags {
        self.flags.entry(id).or_default()
    }

    /// Open the picker on `id` and close it everywhere else, or close it if
    /// it was already open there. Returns whether it is now open.
    pub fn toggle_reaction_picker(&mut self, id: Uuid) -> bool {
        let open = !self.get(id).reaction_picker_open;
        for (other, flags) in self.flags.iter_mut() {
            if *other != id {
                flags.reaction_picker_open = false;
            }
        }
        self.get_mut(id).reaction_picker_open = open;
        self.flags.retain(|_, flags| !flags.is_default());
        open
    }

    /// Only one message is edited at a time.
    pub fn start_editing(&mut self, id: Uuid) {
        for flags in self.flags.values_mut() {
            flags.editing = false;
        }
        self.get_mut(id).editing = true;
    }

    pub fn stop_editing(&mut self) {
        for flags in self.flags.values_mut() {
            flags.editing = false;
        }
        self.flags.retain(|_, flags| !flags.is_default());
    }

    pub fn editing(&self) -> Option<Uuid> {
        self.flags
            .iter()
            .find(|(_, flags)| flags.editing)
            .map(|(id, _)| *id)
    }

    /// Drop flags for messages no longer in view.
    pub fn retain<'a>(&mut self, live: impl IntoIterator<Item = &'a Uuid>) {
        let live: HashSet<&Uuid> = live.into_iter().collect();
        self.flags.retain(|id, _| live.contains(id));
    }

    pub fn clear(&mut self) {
        self.flags.clear();
    }

    pub fn len(&self) -> usize {
        self.flags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_one_picker_is_open() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let mut flags = ViewFlags::new();

        assert!(flags.toggle_reaction_picker(a));
        assert!(flags.toggle_reaction_picker(b));
        assert!(!flags.get(a).reaction_picker_open);
        assert!(flags.get(b).reaction_picker_open);

        assert!(!flags.toggle_reaction_picker(b));
        assert!(flags.is_empty());
    }

    #[test]
    fn retain_drops_flags_for_departed_messages() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let mut flags = ViewFlags::new();
        flags.get_mut(a).hovered = true;
        flags.start_editing(b);
        assert_eq!(flags.editing(), Some(b));

        flags.retain(&[a]);
        assert_eq!(flags.len(), 1);
        assert_eq!(flags.editing(), None);
        assert!(flags.get(a).hovered);
    }

    #[test]
    fn editing_moves_between_messages() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let mut flags = ViewFlags::new();
        flags.start_editing(a);
        flags.start_editing(b);
        assert_eq!(flags.editing(), Some(b));
        assert!(!flags.get(a).editing);

        flags.stop_editing();
        assert_eq!(flags.editing(), None);
        assert!(flags.is_empty());
    }
}
