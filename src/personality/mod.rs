//! Card personalities
//!
//! A personality specializes the generic engine for one real-world
//! card by composition: an ATR, seed content for the file tree and
//! SAM, and an optional protocol extension that intercepts
//! instructions ahead of the fixed table. No subclassing anywhere;
//! the engine stays generic.

pub mod bac;
pub mod pace;

use crate::apdu::Apdu;
use crate::card::atr::default_atr;
use crate::error::CardResult;
use crate::fs::FileTree;
use crate::se::SecureAccessModule;

/// Protocol hook a personality may install. Consulted for every plain
/// command before the generic instruction table.
pub trait ProtocolExtension {
    /// Whether this extension takes the command.
    fn handles(&self, apdu: &Apdu) -> bool;

    /// Execute the command against the card state.
    fn dispatch(
        &mut self,
        apdu: &Apdu,
        fs: &mut FileTree,
        sam: &mut SecureAccessModule,
    ) -> CardResult<Vec<u8>>;

    /// Drop per-session protocol state (power-off, reset).
    fn reset_session(&mut self) {}
}

type SeedFn = Box<dyn FnOnce(&mut FileTree, &mut SecureAccessModule) + Send>;

/// Descriptor of one concrete card, injected into the engine.
pub struct Personality {
    pub label: &'static str,
    pub atr: Vec<u8>,
    seeder: Option<SeedFn>,
    pub extension: Option<Box<dyn ProtocolExtension + Send>>,
}

impl Personality {
    /// A bare interindustry card: default ATR, empty MF, no extension.
    pub fn blank(label: &'static str) -> Self {
        Self {
            label,
            atr: default_atr(),
            seeder: None,
            extension: None,
        }
    }

    pub fn with_atr(mut self, atr: Vec<u8>) -> Self {
        self.atr = atr;
        self
    }

    pub fn with_seeder(mut self, seeder: SeedFn) -> Self {
        self.seeder = Some(seeder);
        self
    }

    pub fn with_extension(mut self, extension: Box<dyn ProtocolExtension + Send>) -> Self {
        self.extension = Some(extension);
        self
    }

    /// Personalize a fresh card: runs once from `CardOs::new`.
    pub fn seed(&mut self, fs: &mut FileTree, sam: &mut SecureAccessModule) {
        if let Some(seeder) = self.seeder.take() {
            seeder(fs, sam);
        }
    }

    /// Forward a session reset to the extension.
    pub fn reset_session(&mut self) {
        if let Some(extension) = self.extension.as_mut() {
            extension.reset_session();
        }
    }
}

impl std::fmt::Debug for Personality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Personality")
            .field("label", &self.label)
            .field("atr", &self.atr)
            .field("extension", &self.extension.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::Selector;

    #[test]
    fn test_blank_personality() {
        let personality = Personality::blank("blank");
        assert_eq!(personality.atr[0], 0x3B);
        assert!(personality.extension.is_none());
    }

    #[test]
    fn test_seeder_runs_once() {
        let mut personality = Personality::blank("seeded").with_seeder(Box::new(|fs, _| {
            let mf = fs.mf();
            fs.plant(
                mf,
                crate::fs::FileNode::transparent(
                    crate::fs::FileHeader::new(0x0101, 0x01),
                    vec![1, 2, 3],
                    None,
                ),
            )
            .unwrap();
        }));
        let mut fs = FileTree::new();
        let mut sam = SecureAccessModule::new(vec![], vec![], vec![]);
        personality.seed(&mut fs, &mut sam);
        assert!(fs.resolve(&Selector::ChildFid(0x0101)).is_ok());
        // A second call is a no-op.
        personality.seed(&mut fs, &mut sam);
    }
}
