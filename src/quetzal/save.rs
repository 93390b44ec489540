//! Save game functionality for Quetzal format

use crate::quetzal::chunks::{IFhdChunk, IntDChunk, StksChunk};
use crate::quetzal::compressed_memory::CMemChunk;
use crate::quetzal::iff::IffFile;
use crate::vm::VM;
use log::debug;

/// SaveGame handles building a Quetzal save image in memory.
pub struct SaveGame {
    iff: IffFile,
}

impl SaveGame {
    /// Build a save image from VM state. `pc_after_save` is the PC execution
    /// should resume at on restore (the instruction after the save opcode).
    pub fn from_vm(vm: &VM, pc_after_save: u32) -> Result<Self, String> {
        let mut iff = IffFile::new();

        let ifhd = IFhdChunk::from_vm(vm, pc_after_save);
        iff.add_chunk(*b"IFhd", ifhd.to_bytes());
        debug!("Added IFhd chunk");

        let original_memory = vm
            .game
            .original_memory
            .as_ref()
            .ok_or("No original memory available for compression")?;

        let dynamic_size = vm.game.header.base_static_mem as usize;
        let current_dynamic = &vm.game.memory[..dynamic_size];
        let original_dynamic = &original_memory[..dynamic_size];

        let cmem = CMemChunk::from_memory(current_dynamic, original_dynamic);
        iff.add_chunk(*b"CMem", cmem.to_bytes());
        debug!(
            "Added CMem chunk ({} bytes compressed)",
            cmem.to_bytes().len()
        );

        let stks = StksChunk::from_vm(vm);
        iff.add_chunk(*b"Stks", stks.to_bytes());
        debug!("Added Stks chunk ({} bytes)", stks.to_bytes().len());

        let intd = IntDChunk::new();
        iff.add_chunk(*b"IntD", intd.to_bytes());
        debug!("Added IntD chunk");

        Ok(SaveGame { iff })
    }

    /// Serialize to the raw bytes handed to the I/O provider's `Save` command.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.iff.to_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::Game;

    fn test_vm() -> VM {
        let mut memory = vec![0u8; 0x2000];
        memory[0] = 3; // version 3
        memory[0x0e] = 0x08; // base_static_mem
        let game = Game::from_memory(memory).unwrap();
        VM::new(game)
    }

    #[test]
    fn save_produces_well_formed_iff() {
        let vm = test_vm();
        let save = SaveGame::from_vm(&vm, 0x4000).unwrap();
        let bytes = save.to_bytes();
        assert_eq!(&bytes[0..4], b"FORM");
        assert_eq!(&bytes[8..12], b"IFZS");
    }
}
