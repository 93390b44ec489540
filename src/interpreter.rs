use crate::error::ZError;
use crate::instruction::{Instruction, OperandType};
use crate::io::{GameType, IoCommand, IoProvider, IoResult, Window};
use crate::text;
use crate::vm::{CallFrame, VM};
use log::{debug, info};
use rand::rngs::StdRng;
use rand::SeedableRng;

/// Result of executing an instruction
#[derive(Debug, Clone)]
pub enum ExecutionResult {
    /// Continue execution normally
    Continue,
    /// Branch taken, PC already updated
    Branched,
    /// Routine called, PC updated
    Called,
    /// Routine returned
    Returned(u16),
    /// Game should quit
    Quit,
    /// Game completed successfully
    GameOver,
    /// Execution error
    Error(String),
}

/// The main Z-Machine interpreter. Owns the VM and the injected I/O
/// provider; there is no global/singleton state.
pub struct Interpreter {
    /// The VM state
    pub vm: VM,
    /// Enable debug output
    pub debug: bool,
    /// Instruction count, used for the runaway-execution safety cap
    instruction_count: u64,
    /// The injected presentation layer (terminal/TUI/headless/logging).
    pub io: Box<dyn IoProvider>,
    /// In-memory undo snapshot used by `save_undo`/`restore_undo` (EXT, v5+).
    undo_snapshot: Option<UndoSnapshot>,
    /// Stack of active stream-3 (memory capture) tables: (table address,
    /// buffered ZSCII bytes). Non-empty means screen output (streams 1/2) is
    /// suppressed and all printing is diverted into the innermost table.
    stream3_stack: Vec<(u32, Vec<u8>)>,
    /// PRNG backing the `random` opcode. Reseeded from entropy (operand 0)
    /// or deterministically (negative operand) per the opcode's own semantics.
    rng: StdRng,
}

/// A single in-memory Quetzal-style snapshot: dynamic memory plus the call
/// and evaluation stacks, captured for `save_undo`/`restore_undo`.
struct UndoSnapshot {
    dynamic_memory: Vec<u8>,
    call_stack: Vec<CallFrame>,
    stack: Vec<u16>,
    pc: u32,
    store_var: Option<u8>,
}

impl Interpreter {
    /// Create a new interpreter with an injected I/O provider. Providers are
    /// constructed by the caller and handed in here rather than discovered
    /// internally, so the engine never depends on a concrete presentation
    /// layer.
    pub fn new(vm: VM, io: Box<dyn IoProvider>) -> Self {
        Interpreter {
            vm,
            debug: false,
            instruction_count: 0,
            io,
            undo_snapshot: None,
            stream3_stack: Vec::new(),
            rng: StdRng::from_entropy(),
        }
    }

    /// Enable or disable debug logging verbosity.
    pub fn set_debug(&mut self, debug: bool) {
        self.debug = debug;
    }

    fn print(&mut self, window: Window, text: &str) {
        if let Some((_, buf)) = self.stream3_stack.last_mut() {
            buf.extend(text.bytes());
            return;
        }
        self.io.command(IoCommand::Print {
            window,
            text: text.to_string(),
        });
    }

    /// Run the interpreter
    pub fn run(&mut self) -> Result<(), ZError> {
        self.run_with_limit(None)
    }

    pub fn run_with_limit(&mut self, max_instructions: Option<u64>) -> Result<(), ZError> {
        info!("Starting Z-Machine interpreter...");
        info!("Initial PC: {:05x}", self.vm.pc);

        if self.vm.game.header.version == 3 {
            self.io.command(IoCommand::ClearScreen { window_id: -1 });
            self.io.command(IoCommand::SplitWindow { lines: 1 });
        } else {
            self.io.command(IoCommand::ClearScreen { window_id: -1 });
        }

        loop {
            // Fetch and decode instruction
            let pc = self.vm.pc;
            let instruction = match Instruction::decode(
                &self.vm.game.memory,
                pc as usize,
                self.vm.game.header.version,
            ) {
                Ok(inst) => inst,
                Err(e) => {
                    return Err(ZError::InstructionDecode(format!(
                        "failed to decode instruction at {pc:05x}: {e}"
                    )));
                }
            };

            if self.debug {
                debug!(
                    "{:05x}: {} (form={:?}, opcode={:02x})",
                    pc, instruction, instruction.form, instruction.opcode
                );
            }

            // Advance PC past the instruction
            self.vm.pc += instruction.size as u32;

            // Execute the instruction
            match self.execute_instruction(&instruction)? {
                ExecutionResult::Continue => {
                    // Normal execution, PC already advanced
                }
                ExecutionResult::Branched => {
                    // Branch taken, PC was updated by branch logic
                }
                ExecutionResult::Called => {
                    // Routine called, PC was updated
                }
                ExecutionResult::Returned(_value) => {
                    // Return value already handled by do_return
                }
                ExecutionResult::Quit => {
                    // Quit opcode executed - exit the entire program immediately
                    std::process::exit(0);
                }
                ExecutionResult::GameOver => {
                    // Game over - return normally
                    return Ok(());
                }
                ExecutionResult::Error(e) => {
                    return Err(ZError::Internal(format!("execution error at {pc:05x}: {e}")));
                }
            }

            self.instruction_count += 1;

            // Check instruction limit
            if let Some(limit) = max_instructions {
                if self.instruction_count >= limit {
                    info!("Reached instruction limit of {}", limit);
                    return Ok(());
                }
            }

            // Safety check for runaway execution
            if self.instruction_count > 1_000_000 {
                return Err(ZError::Internal("instruction limit exceeded".to_string()));
            }
        }
    }

    /// Execute a single instruction
    pub fn execute_instruction(&mut self, inst: &Instruction) -> Result<ExecutionResult, ZError> {
        // Get operand values
        let operands = self.resolve_operands(inst)?;

        // Debug problematic variables
        if let Some(store_var) = inst.store_var {
            if (0x01..=0x0F).contains(&store_var) {
                let frame = self
                    .vm
                    .call_stack
                    .last()
                    .ok_or("No active routine for local variable access")?;
                if store_var as usize > frame.num_locals as usize {
                    let pc = self.vm.pc - inst.size as u32;
                    debug!("Instruction at {:05x}: {} trying to store to V{:02x} but routine only has {} locals", 
                           pc, inst, store_var, frame.num_locals);
                    debug!(
                        "Call stack depth: {}, routine started at PC {:05x}",
                        self.vm.call_stack.len(),
                        frame.return_pc
                    );
                }
            }
        }

        // Check operands that read from local variables
        for (i, &operand) in inst.operands.iter().enumerate() {
            if inst.operand_types[i] == crate::instruction::OperandType::Variable {
                let var_num = operand as u8;
                if (0x01..=0x0F).contains(&var_num) {
                    let frame = self
                        .vm
                        .call_stack
                        .last()
                        .ok_or("No active routine for local variable access")?;
                    if var_num as usize > frame.num_locals as usize {
                        let pc = self.vm.pc - inst.size as u32;
                        debug!("Instruction at {:05x}: {} trying to read from V{:02x} but routine only has {} locals", 
                               pc, inst, var_num, frame.num_locals);
                    }
                }
            }
        }

        match inst.form {
            crate::instruction::InstructionForm::Short => match inst.operand_count {
                crate::instruction::OperandCount::OP0 => self.execute_0op(inst),
                crate::instruction::OperandCount::OP1 => self.execute_1op(inst, operands[0]),
                _ => Err(ZError::Internal(format!(
                    "Invalid operand count for short form: {:?}",
                    inst.operand_count
                ))),
            },
            crate::instruction::InstructionForm::Long => {
                self.execute_2op(inst, operands[0], operands[1])
            }
            crate::instruction::InstructionForm::Variable => {
                match inst.operand_count {
                    crate::instruction::OperandCount::OP2 => {
                        // IMPORTANT: Variable form 2OP instructions
                        // ==========================================
                        // When a 2OP instruction is encoded in Variable form (as opposed to Long form),
                        // the actual number of operands is determined by the operand types byte(s),
                        // NOT by the "2OP" designation. The "2OP" here means the instruction uses
                        // opcodes 0-31 from the 2OP instruction set, not that it has exactly 2 operands.
                        //
                        // Most 2OP instructions only use 2 operands even in Variable form, but some
                        // (notably 'je') can use up to 4 operands as specified in the Z-Machine spec.
                        //
                        // From the spec: "je a b c d ?(label)" - Jump if a equals any of b, c, or d

                        self.execute_2op_variable(inst, &operands)
                    }
                    _ => self.execute_var(inst, &operands),
                }
            }
            crate::instruction::InstructionForm::Extended => self.execute_ext(inst, &operands),
        }
    }

    /// Resolve operand values (handle variables vs constants)
    pub fn resolve_operands(&mut self, inst: &Instruction) -> Result<Vec<u16>, ZError> {
        let mut values = Vec::new();

        for (i, &operand) in inst.operands.iter().enumerate() {
            let value = match inst.operand_types[i] {
                OperandType::Variable => {
                    // Read from variable
                    let var_num = operand as u8;
                    if var_num == 0 {
                        // Variable 0 means pop from stack when used as operand
                        self.vm.pop()?
                    } else {
                        self.vm.read_variable(var_num)?
                    }
                }
                _ => {
                    // Use literal value
                    operand
                }
            };
            values.push(value);
        }

        Ok(values)
    }

    /// Execute 0OP instructions
    fn execute_0op(&mut self, inst: &Instruction) -> Result<ExecutionResult, ZError> {
        match inst.opcode {
            0x00 => {
                // rtrue
                self.do_return(1)
            }
            0x01 => {
                // rfalse
                self.do_return(0)
            }
            0x02 => {
                // print (literal string)
                if let Some(ref text) = inst.text {
                    // Log first part of all print strings for debugging
                    let preview = if text.len() > 40 {
                        format!("{}...", &text[..40])
                    } else {
                        text.clone()
                    };
                    debug!(
                        "print at PC {:05x}: '{}'",
                        self.vm.pc - inst.size as u32,
                        preview
                    );

                    self.print(Window::Main, text);
                }
                Ok(ExecutionResult::Continue)
            }
            0x03 => {
                // print_ret
                if let Some(ref text) = inst.text {
                    self.print(Window::Main, text);
                    self.print(Window::Main, "\n");
                }
                self.do_return(1)
            }
            0x04 => {
                // nop
                Ok(ExecutionResult::Continue)
            }
            0x05 => {
                // save (V1-3: branch on success, V4+: store result)
                let save_result = self.do_save();
                if self.vm.game.header.version <= 3 {
                    if inst.branch.is_some() {
                        self.do_branch(inst, save_result)
                    } else {
                        Err(ZError::SaveFailed(
                            "save instruction without branch info".to_string(),
                        ))
                    }
                } else if let Some(store_var) = inst.store_var {
                    self.vm.write_variable(store_var, save_result as u16)?;
                    Ok(ExecutionResult::Continue)
                } else {
                    Ok(ExecutionResult::Continue)
                }
            }
            0x06 => {
                // restore (V1-3: branch on success, V4+: store result)
                let restore_result = self.do_restore();
                if self.vm.game.header.version <= 3 {
                    if inst.branch.is_some() {
                        self.do_branch(inst, restore_result)
                    } else {
                        Ok(ExecutionResult::Continue)
                    }
                } else if restore_result {
                    // Success resumes execution right after the original `save`
                    // call, whose result the restored state never got to write
                    // (the snapshot was taken just before that write). The
                    // standard requires that call now read back 2, not 0; its
                    // store_var byte is the one right before our new PC, since
                    // a 0OP store opcode is a single opcode byte followed by
                    // the store_var byte.
                    if self.vm.pc > 0 {
                        let store_var = self.vm.read_byte(self.vm.pc - 1);
                        self.vm.write_variable(store_var, 2)?;
                    }
                    Ok(ExecutionResult::Branched)
                } else {
                    if let Some(store_var) = inst.store_var {
                        self.vm.write_variable(store_var, 0)?;
                    }
                    Ok(ExecutionResult::Continue)
                }
            }
            0x07 => {
                // restart: reload the story image and jump to the initial PC
                self.vm.restart();
                Ok(ExecutionResult::Branched)
            }
            0x08 => {
                // ret_popped
                let value = self.vm.pop()?;
                self.do_return(value)
            }
            0x09 => {
                // pop (V1-4) / catch (V5+)
                if self.vm.game.header.version <= 4 {
                    self.vm.pop()?;
                    Ok(ExecutionResult::Continue)
                } else {
                    // catch: store call stack depth
                    if let Some(store_var) = inst.store_var {
                        let depth = self.vm.call_depth() as u16;
                        self.vm.write_variable(store_var, depth)?;
                    }
                    Ok(ExecutionResult::Continue)
                }
            }
            0x0A => {
                // quit
                Ok(ExecutionResult::Quit)
            }
            0x0B => {
                // new_line
                self.print(Window::Main, "\n");
                Ok(ExecutionResult::Continue)
            }
            0x0C => {
                // show_status (V3 only)
                if self.vm.game.header.version == 3 {
                    debug!("show_status called");

                    // Get location name from G16 (player's location in v3)
                    let location_obj = self.vm.read_global(16)?; // G16 contains player location in v3
                    let location_name = if location_obj > 0 {
                        self.get_object_name(location_obj)?
                    } else {
                        "Unknown".to_string()
                    };

                    // Get score and moves from globals (G17 and G18 in v3)
                    let score = self.vm.read_global(17)? as i16;
                    let moves = self.vm.read_global(18)?;

                    let game_type = if self.vm.game.header.flag1_bit(1) {
                        GameType::Time
                    } else {
                        GameType::Score
                    };
                    self.io.command(IoCommand::Status {
                        room_name: location_name,
                        game_type,
                        score_one: score,
                        score_two: moves as i16,
                    });
                }
                Ok(ExecutionResult::Continue)
            }
            0x0D => {
                // verify: branch if the story file's checksum matches the
                // header's declared checksum. Summed over bytes 0x40..file_length.
                let header = &self.vm.game.header;
                let image = self
                    .vm
                    .game
                    .original_memory
                    .as_ref()
                    .unwrap_or(&self.vm.game.memory);
                let mut sum: u16 = 0;
                for addr in 0x40..header.file_length.min(image.len()) {
                    sum = sum.wrapping_add(image[addr] as u16);
                }
                self.do_branch(inst, sum == header.checksum_file)
            }
            0x0F => {
                // piracy
                // Copy protection check - interpreters should be "gullible and unconditionally branch"
                // This means always take the branch regardless of the branch condition
                if let Some(ref branch) = inst.branch {
                    match branch.offset {
                        0 => self.do_return(0), // rfalse
                        1 => self.do_return(1), // rtrue
                        offset => {
                            // Jump is relative to instruction after branch data
                            let new_pc = (self.vm.pc as i32 + offset as i32 - 2) as u32;
                            self.vm.pc = new_pc;
                            Ok(ExecutionResult::Branched)
                        }
                    }
                } else {
                    Err(ZError::Internal("piracy instruction without branch info".to_string()))
                }
            }
            _ => Err(ZError::Internal(format!(
                "Unimplemented 0OP instruction: {:02x}",
                inst.opcode
            ))),
        }
    }

    /// Execute 1OP instructions
    fn execute_1op(&mut self, inst: &Instruction, operand: u16) -> Result<ExecutionResult, ZError> {
        match inst.opcode {
            0x00 => {
                // jz
                let condition = operand == 0;
                self.do_branch(inst, condition)
            }
            0x05 => {
                // inc
                let var_num = inst.operands[0] as u8;
                let value = self.vm.read_variable(var_num)?;
                self.vm.write_variable(var_num, value.wrapping_add(1))?;
                Ok(ExecutionResult::Continue)
            }
            0x06 => {
                // dec
                let var_num = inst.operands[0] as u8;
                let value = self.vm.read_variable(var_num)?;
                self.vm.write_variable(var_num, value.wrapping_sub(1))?;
                Ok(ExecutionResult::Continue)
            }
            0x0B => {
                // ret
                self.do_return(operand)
            }
            0x0C => {
                // jump
                // Jump is a signed offset from the instruction after the branch data
                let offset = operand as i16;
                let new_pc = (self.vm.pc as i32 + offset as i32 - 2) as u32;
                self.vm.pc = new_pc;
                Ok(ExecutionResult::Branched)
            }
            0x0D => {
                // print_paddr
                // Print string at packed address
                let pc = self.vm.pc - inst.size as u32;
                debug!("print_paddr at {:05x}: operand={:04x}", pc, operand);

                match text::decode_string_at_packed_addr(
                    &self.vm.game.memory,
                    operand,
                    &self.vm.game.header,
                ) {
                    Ok(string) => self.print(Window::Main, &string),
                    Err(e) => {
                        debug!("Failed to decode string at {:04x}: {}", operand, e);
                    }
                }
                Ok(ExecutionResult::Continue)
            }
            0x0E => {
                // load
                if inst.operand_types[0] != OperandType::Variable {
                    return Err(ZError::Internal("load requires variable operand".to_string()));
                }
                let var_num = inst.operands[0] as u8;
                let value = self.vm.read_variable(var_num)?;
                if let Some(store_var) = inst.store_var {
                    self.vm.write_variable(store_var, value)?;
                }
                Ok(ExecutionResult::Continue)
            }
            0x0F => {
                // not (V1-4) / call_1n (V5+)
                if self.vm.game.header.version <= 4 {
                    // Bitwise NOT
                    if let Some(store_var) = inst.store_var {
                        self.vm.write_variable(store_var, !operand)?;
                    }
                } else {
                    // call_1n: call with no return value
                    self.do_call(operand, &[], None)?;
                    return Ok(ExecutionResult::Called);
                }
                Ok(ExecutionResult::Continue)
            }
            0x01 => {
                // get_sibling
                let sibling = self.vm.get_sibling(operand)?;
                if let Some(store_var) = inst.store_var {
                    self.vm.write_variable(store_var, sibling)?;
                }
                self.do_branch(inst, sibling != 0)
            }
            0x02 => {
                // get_child
                let child = self.vm.get_child(operand)?;
                if let Some(store_var) = inst.store_var {
                    self.vm.write_variable(store_var, child)?;
                }
                self.do_branch(inst, child != 0)
            }
            0x03 => {
                // get_parent
                debug!(
                    "get_parent: obj_num={} at PC {:05x}",
                    operand,
                    self.vm.pc - inst.size as u32
                );
                let parent = self.vm.get_parent(operand)?;
                if let Some(store_var) = inst.store_var {
                    self.vm.write_variable(store_var, parent)?;
                }
                Ok(ExecutionResult::Continue)
            }
            0x04 => {
                // get_prop_len - get the length of a property given its data address
                debug!(
                    "get_prop_len: prop_addr={:04x} at PC {:05x}",
                    operand,
                    self.vm.pc - inst.size as u32
                );

                let prop_len = if operand == 0 {
                    0
                } else {
                    // In Z-Machine v3, the size byte is immediately before the property data
                    // The size byte encodes: top 3 bits = size-1, bottom 5 bits = property number
                    let size_byte_addr = (operand as u32).saturating_sub(1);
                    let size_byte = self.vm.read_byte(size_byte_addr);
                    let size = ((size_byte >> 5) & 0x07) + 1;
                    debug!(
                        "  Size byte at {:04x}: {:02x}, property size: {}",
                        size_byte_addr, size_byte, size
                    );
                    size as u16
                };

                if let Some(store_var) = inst.store_var {
                    self.vm.write_variable(store_var, prop_len)?;
                }
                Ok(ExecutionResult::Continue)
            }
            0x07 => {
                // print_addr
                // Print string at unpacked address
                let addr = operand as usize;
                let abbrev_addr = self.vm.game.header.abbrev_table;
                debug!(
                    "print_addr: addr={:04x} at PC {:05x}",
                    addr,
                    self.vm.pc - inst.size as u32
                );

                match text::decode_string(&self.vm.game.memory, addr, abbrev_addr) {
                    Ok((string, _)) => self.print(Window::Main, &string),
                    Err(e) => {
                        debug!("Failed to decode string at {:04x}: {}", addr, e);
                    }
                }
                Ok(ExecutionResult::Continue)
            }
            0x09 => {
                // remove_obj
                let obj_num = operand;
                debug!(
                    "remove_obj: obj_num={} at PC {:05x}",
                    obj_num,
                    self.vm.pc - inst.size as u32
                );
                self.vm.remove_object(obj_num)?;
                Ok(ExecutionResult::Continue)
            }
            0x08 => {
                // call_1s
                self.do_call(operand, &[], inst.store_var)?;
                Ok(ExecutionResult::Called)
            }
            0x0A => {
                // print_obj - print short name of object
                let obj_num = operand;
                if obj_num == 0 {
                    // Object 0 means no object - print nothing
                    return Ok(ExecutionResult::Continue);
                }
                let name = self.get_object_name(obj_num)?;
                self.print(Window::Main, &name);
                Ok(ExecutionResult::Continue)
            }
            _ => Err(ZError::Internal(format!(
                "Unimplemented 1OP instruction: {:02x}",
                inst.opcode
            ))),
        }
    }

    /// Execute 2OP instructions
    fn execute_2op(
        &mut self,
        inst: &Instruction,
        op1: u16,
        op2: u16,
    ) -> Result<ExecutionResult, ZError> {
        match inst.opcode {
            0x00 => {
                // 2OP:0x00 is not defined in the Z-Machine spec
                // This might be data being executed as code
                let pc = self.vm.pc - inst.size as u32;
                debug!("WARNING: Invalid 2OP:0x00 at PC {:05x} with operands {:04x}, {:04x} - treating as NOP", 
                       pc, op1, op2);
                Ok(ExecutionResult::Continue)
            }
            0x01 => {
                // je
                let condition = op1 == op2;
                self.do_branch(inst, condition)
            }
            0x02 => {
                // jl
                let condition = (op1 as i16) < (op2 as i16);
                self.do_branch(inst, condition)
            }
            0x03 => {
                // jg
                let condition = (op1 as i16) > (op2 as i16);
                self.do_branch(inst, condition)
            }
            0x04 => {
                // dec_chk - decrement variable and branch if less than value
                // IMPORTANT: The first operand is ALWAYS a variable number, never a value
                // This is different from most 2OP instructions
                let var_num = inst.operands[0] as u8;
                let value = self.vm.read_variable(var_num)?;
                let new_value = value.wrapping_sub(1);
                self.vm.write_variable(var_num, new_value)?;
                let condition = (new_value as i16) < (op2 as i16);
                self.do_branch(inst, condition)
            }
            0x05 => {
                // inc_chk - increment variable and branch if greater than value
                // IMPORTANT: The first operand is ALWAYS a variable number, never a value
                // This is different from most 2OP instructions
                let var_num = inst.operands[0] as u8;
                let value = self.vm.read_variable(var_num)?;
                let new_value = value.wrapping_add(1);
                self.vm.write_variable(var_num, new_value)?;
                let condition = (new_value as i16) > (op2 as i16);
                self.do_branch(inst, condition)
            }
            0x06 => {
                // jin
                // Check if obj1 is inside obj2 (obj1's parent is obj2)
                let parent = self.vm.get_parent(op1)?;
                let condition = parent == op2;
                self.do_branch(inst, condition)
            }
            0x07 => {
                // test
                // Bitwise AND and test if all bits in op2 are set in op1
                let result = (op1 & op2) == op2;
                self.do_branch(inst, result)
            }
            0x08 => {
                // or
                if let Some(store_var) = inst.store_var {
                    self.vm.write_variable(store_var, op1 | op2)?;
                }
                Ok(ExecutionResult::Continue)
            }
            0x09 => {
                // and
                if let Some(store_var) = inst.store_var {
                    self.vm.write_variable(store_var, op1 & op2)?;
                }
                Ok(ExecutionResult::Continue)
            }
            0x0A => {
                // test_attr
                let obj_num = op1;
                let attr_num = op2 as u8;
                let result = self.vm.test_attribute(obj_num, attr_num)?;
                self.do_branch(inst, result)
            }
            0x0B => {
                // set_attr
                let obj_num = op1;
                let attr_num = op2 as u8;
                self.vm.set_attribute(obj_num, attr_num, true)?;
                Ok(ExecutionResult::Continue)
            }
            0x0C => {
                // clear_attr
                let obj_num = op1;
                let attr_num = op2 as u8;
                self.vm.set_attribute(obj_num, attr_num, false)?;
                Ok(ExecutionResult::Continue)
            }
            0x0D => {
                // store
                // Use raw operand for variable number (destination)
                let var_num = inst.operands[0] as u8;
                self.vm.write_variable(var_num, op2)?;
                Ok(ExecutionResult::Continue)
            }
            0x0E => {
                // insert_obj
                self.vm.insert_object(op1, op2)?;
                Ok(ExecutionResult::Continue)
            }
            0x0F => {
                // loadw
                let addr = op1 as u32 + (op2 as u32 * 2);
                let value = self.vm.read_word(addr);
                if let Some(store_var) = inst.store_var {
                    self.vm.write_variable(store_var, value)?;
                }
                Ok(ExecutionResult::Continue)
            }
            0x10 => {
                // loadb
                let addr = op1 as u32 + op2 as u32;
                let value = self.vm.read_byte(addr) as u16;
                if let Some(store_var) = inst.store_var {
                    self.vm.write_variable(store_var, value)?;
                }
                Ok(ExecutionResult::Continue)
            }
            0x11 => {
                // get_prop
                let obj_num = op1;
                let prop_num = op2 as u8;
                let value = self.vm.get_property(obj_num, prop_num)?;

                if let Some(store_var) = inst.store_var {
                    self.vm.write_variable(store_var, value)?;
                }
                Ok(ExecutionResult::Continue)
            }
            0x12 => {
                // get_prop_addr
                let obj_num = op1;
                let prop_num = op2 as u8;
                let addr = self.vm.get_property_addr(obj_num, prop_num)? as u16;
                if let Some(store_var) = inst.store_var {
                    self.vm.write_variable(store_var, addr)?;
                }
                Ok(ExecutionResult::Continue)
            }
            0x13 => {
                // get_next_prop
                let obj_num = op1;
                let prop_num = op2 as u8;
                let next_prop = self.vm.get_next_property(obj_num, prop_num)? as u16;
                if let Some(store_var) = inst.store_var {
                    self.vm.write_variable(store_var, next_prop)?;
                }
                Ok(ExecutionResult::Continue)
            }
            0x14 => {
                // add
                if let Some(store_var) = inst.store_var {
                    let result = (op1 as i16).wrapping_add(op2 as i16) as u16;
                    self.vm.write_variable(store_var, result)?;
                }
                Ok(ExecutionResult::Continue)
            }
            0x15 => {
                // sub
                if let Some(store_var) = inst.store_var {
                    let result = (op1 as i16).wrapping_sub(op2 as i16) as u16;
                    self.vm.write_variable(store_var, result)?;
                }
                Ok(ExecutionResult::Continue)
            }
            0x16 => {
                // mul
                if let Some(store_var) = inst.store_var {
                    let result = (op1 as i16).wrapping_mul(op2 as i16) as u16;
                    self.vm.write_variable(store_var, result)?;
                }
                Ok(ExecutionResult::Continue)
            }
            0x17 => {
                // div
                if op2 == 0 {
                    return Err(ZError::Internal("Division by zero".to_string()));
                }
                if let Some(store_var) = inst.store_var {
                    let result = (op1 as i16) / (op2 as i16);
                    self.vm.write_variable(store_var, result as u16)?;
                }
                Ok(ExecutionResult::Continue)
            }
            0x18 => {
                // mod
                if op2 == 0 {
                    return Err(ZError::Internal("Modulo by zero".to_string()));
                }
                if let Some(store_var) = inst.store_var {
                    let result = (op1 as i16) % (op2 as i16);
                    self.vm.write_variable(store_var, result as u16)?;
                }
                Ok(ExecutionResult::Continue)
            }
            0x19 => {
                // call_2s
                let routine_addr = op1;
                let arg = op2;
                self.do_call(routine_addr, &[arg], inst.store_var)?;
                Ok(ExecutionResult::Called)
            }
            0x1A => {
                // call_2n (V5+): call with 1 argument, discard the result
                self.do_call(op1, &[op2], None)?;
                Ok(ExecutionResult::Called)
            }
            0x1B => {
                // set_colour (V5+)
                self.io.command(IoCommand::SetColour {
                    fg: op1 as u8,
                    bg: op2 as u8,
                });
                Ok(ExecutionResult::Continue)
            }
            0x1C => {
                // throw (V5+): unwind the call stack to the frame identified
                // by the catch token in op2, then return op1 from it.
                let target_depth = op2 as usize;
                if target_depth == 0 || target_depth > self.vm.call_stack.len() {
                    return Err(ZError::Internal(format!(
                        "throw: invalid catch token {op2}"
                    )));
                }
                self.vm.call_stack.truncate(target_depth);
                self.do_return(op1)
            }
            _ => {
                let pc = self.vm.pc - inst.size as u32;
                debug!(
                    "Unimplemented 2OP instruction: {:02x} at PC {:05x}, form={:?}",
                    inst.opcode, pc, inst.form
                );
                Err(ZError::Internal(format!(
                    "Unimplemented 2OP instruction: {:02x}",
                    inst.opcode
                )))
            }
        }
    }

    /// Execute 2OP instructions in Variable form
    ///
    /// This method handles 2OP instructions that are encoded in Variable form,
    /// which may have more than 2 operands. The actual operand count is determined
    /// by the operand types byte(s) in the instruction encoding.
    fn execute_2op_variable(
        &mut self,
        inst: &Instruction,
        operands: &[u16],
    ) -> Result<ExecutionResult, ZError> {
        // Handle edge cases first
        if operands.is_empty() && inst.opcode == 0x09 {
            // Special case: Variable 2OP AND with no operands
            // This appears in some games - treat as AND 0, 0
            debug!(
                "Variable 2OP AND with no operands at PC {:05x} - using 0, 0",
                self.vm.pc - inst.size as u32
            );
            return self.execute_2op(inst, 0, 0);
        }

        // Most 2OP instructions require at least 2 operands
        if operands.len() < 2 {
            let pc = self.vm.pc - inst.size as u32;
            return Err(ZError::Internal(format!("Variable 2OP instruction at PC {:05x} requires at least 2 operands, got {} - opcode: {:02x}",
                               pc, operands.len(), inst.opcode)));
        }

        // Handle each 2OP instruction based on its specific requirements
        match inst.opcode {
            0x01 => {
                // je - Jump if Equal (can have 2-4 operands)
                // From the spec: "je a b c d ?(label)"
                // Jump if a is equal to any of the subsequent operands (b, c, or d)
                let mut condition = false;
                for i in 1..operands.len() {
                    if operands[0] == operands[i] {
                        condition = true;
                        break;
                    }
                }
                self.do_branch(inst, condition)
            }
            _ => {
                // All other 2OP instructions use exactly 2 operands
                // Even in Variable form, they ignore any extra operands
                self.execute_2op(inst, operands[0], operands[1])
            }
        }
    }

    /// Execute VAR instructions
    fn execute_var(
        &mut self,
        inst: &Instruction,
        operands: &[u16],
    ) -> Result<ExecutionResult, ZError> {
        match inst.opcode {
            0x00 => {
                // call
                if operands.is_empty() {
                    return Err(ZError::Internal("call requires at least one operand".to_string()));
                }
                let routine_addr = operands[0];
                let args = &operands[1..];
                let unpacked_addr = self.unpack_routine_address(routine_addr) as u32;
                debug!(
                    "Call to packed address 0x{:04x} (unpacked: 0x{:05x}) with store_var = {:?}",
                    routine_addr, unpacked_addr, inst.store_var
                );
                self.do_call(routine_addr, args, inst.store_var)?;
                Ok(ExecutionResult::Called)
            }
            0x01 => {
                // storew
                if operands.len() < 3 {
                    // For Variable form with OP2, this might be 2OP:21 (storew) not VAR:01
                    if inst.form == crate::instruction::InstructionForm::Variable
                        && inst.operand_count == crate::instruction::OperandCount::OP2
                    {
                        // This is actually 2OP:21 (storew) in Variable form
                        debug!("Note: Variable form storew with OP2 at PC {:05x} - this is 2OP:21 in Variable form", 
                               self.vm.pc - inst.size as u32);
                    }
                    return Err(ZError::Internal(format!(
                        "storew at PC {:05x} requires 3 operands, got {} (operands: {:?}) - instruction form: {:?}, opcode: {:02x}, operand_count: {:?}",
                        self.vm.pc - inst.size as u32, operands.len(), operands, inst.form, inst.opcode, inst.operand_count
                    )));
                }
                let addr = operands[0] as u32 + (operands[1] as u32 * 2);
                self.vm.write_word(addr, operands[2])?;
                Ok(ExecutionResult::Continue)
            }
            0x02 => {
                // storeb
                if operands.len() < 3 {
                    return Err(ZError::Internal("storeb requires 3 operands".to_string()));
                }
                let addr = operands[0] as u32 + operands[1] as u32;
                self.vm.write_byte(addr, operands[2] as u8)?;
                Ok(ExecutionResult::Continue)
            }
            0x03 => {
                // put_prop
                if operands.len() < 3 {
                    return Err(ZError::Internal("put_prop requires 3 operands".to_string()));
                }
                let obj_num = operands[0];
                let prop_num = operands[1] as u8;
                let value = operands[2];
                self.vm.put_property(obj_num, prop_num, value)?;
                Ok(ExecutionResult::Continue)
            }
            0x04 => {
                // sread (V1-4) with timer support (V3+)
                if operands.len() < 2 {
                    return Err(ZError::Internal(
                        "sread requires at least 2 operands".to_string(),
                    ));
                }
                let text_buffer = operands[0] as u32;
                let parse_buffer = operands[1] as u32;

                let has_timer = operands.len() >= 4 && operands[2] > 0 && operands[3] > 0;
                let routine = if operands.len() > 3 { operands[3] } else { 0 };

                // In v3 games, automatically refresh the status line before input.
                if self.vm.game.header.version == 3 {
                    let location_obj = self.vm.read_global(16)?;
                    let location_name = self.get_object_name(location_obj)?;
                    let score = self.vm.read_global(17)? as i16;
                    let moves = self.vm.read_global(18)?;
                    let game_type = if self.vm.game.header.flag1_bit(1) {
                        GameType::Time
                    } else {
                        GameType::Score
                    };
                    self.io.command(IoCommand::Status {
                        room_name: location_name,
                        game_type,
                        score_one: score,
                        score_two: moves as i16,
                    });
                }

                let max_len = self.vm.read_byte(text_buffer);

                let input = match self.io.command(IoCommand::Read) {
                    IoResult::Line(line) => line,
                    _ => String::new(),
                };

                // No real-time interrupt from a synchronous provider; fire the
                // timer routine once after the read completes, matching the
                // turn-based approximation the interpreter already uses for
                // `read_char`.
                if has_timer && routine > 0 {
                    let _ = self.call_timer_routine(routine)?;
                }

                // Convert to lowercase - Z-Machine convention
                let input = input.to_lowercase();

                // Limit input to max_len - 1 (leaving room for the terminator
                // in V1-4, or simply to stay inside the buffer in V5+).
                let input_bytes = input.as_bytes();
                let input_len = input_bytes.len().min(max_len.saturating_sub(1) as usize);

                // Text buffer format differs by version:
                // V1-4: max_len, characters..., 0 (zero-terminated, no count byte)
                // V5+:  max_len, actual_len, characters...
                if self.vm.game.header.version <= 4 {
                    for (i, &ch) in input_bytes.iter().take(input_len).enumerate() {
                        self.vm.write_byte(text_buffer + 1 + i as u32, ch)?;
                    }
                    self.vm.write_byte(text_buffer + 1 + input_len as u32, 0)?;
                } else {
                    self.vm.write_byte(text_buffer + 1, input_len as u8)?;
                    for (i, &ch) in input_bytes.iter().take(input_len).enumerate() {
                        self.vm.write_byte(text_buffer + 2 + i as u32, ch)?;
                    }
                }

                // V5+ (aread) stores the terminator character; a synchronous
                // line-based provider always terminates on newline.
                if let Some(store_var) = inst.store_var {
                    self.vm.write_variable(store_var, 13)?;
                }

                // parse_buffer == 0 (V5+) means the caller wants raw text only.
                if parse_buffer != 0 {
                    self.vm.parse_text(text_buffer, parse_buffer)?;
                }

                Ok(ExecutionResult::Continue)
            }
            0x05 => {
                // print_char
                if !operands.is_empty() {
                    let ch = operands[0] as u8 as char;
                    self.print(Window::Main, &ch.to_string());
                }
                Ok(ExecutionResult::Continue)
            }
            0x06 => {
                // print_num
                if !operands.is_empty() {
                    let num_str = format!("{}", operands[0] as i16);
                    self.print(Window::Main, &num_str);
                }
                Ok(ExecutionResult::Continue)
            }
            0x07 => {
                // random
                if !operands.is_empty() {
                    let range = operands[0] as i16;
                    let result = if range == 0 {
                        // Reseed from a fresh entropy source.
                        self.rng = StdRng::from_entropy();
                        debug!("Random reseeded from entropy");
                        0
                    } else if range < 0 {
                        // Reseed deterministically from the magnitude given.
                        self.rng = StdRng::seed_from_u64(range.unsigned_abs() as u64);
                        debug!("Random reseeded deterministically with {}", range);
                        0
                    } else {
                        // Return a value from 1 to range inclusive
                        use rand::Rng;
                        let value = self.rng.gen_range(1..=range as u16);
                        debug!("Random({}) = {}", range, value);
                        value
                    };

                    if let Some(store_var) = inst.store_var {
                        self.vm.write_variable(store_var, result)?;
                    }
                }
                Ok(ExecutionResult::Continue)
            }
            0x08 => {
                // push
                if !operands.is_empty() {
                    self.vm.push(operands[0])?;
                }
                Ok(ExecutionResult::Continue)
            }
            0x09 => {
                // pull
                if !inst.operands.is_empty() {
                    let value = self.vm.pop()?;
                    // Use the raw operand value, not the resolved one
                    // (Variable 0 as destination means V00, not pop)
                    let var_num = inst.operands[0] as u8;
                    self.vm.write_variable(var_num, value)?;
                }
                Ok(ExecutionResult::Continue)
            }
            0x0A => {
                // split_window (V3+)
                if !operands.is_empty() {
                    let lines = operands[0];
                    self.io.command(IoCommand::SplitWindow { lines });
                }
                Ok(ExecutionResult::Continue)
            }
            0x0B => {
                // set_window (V3+)
                if !operands.is_empty() {
                    let window = if operands[0] == 0 {
                        Window::Main
                    } else {
                        Window::Status
                    };
                    self.io.command(IoCommand::SetWindow { window });
                }
                Ok(ExecutionResult::Continue)
            }
            0x0D => {
                // erase_window - actually used in v3 (Seastalker uses it)
                if !operands.is_empty() {
                    let window_id = operands[0] as i16;
                    self.io.command(IoCommand::ClearScreen { window_id });
                }
                Ok(ExecutionResult::Continue)
            }
            0x13 => {
                // output_stream
                if !operands.is_empty() {
                    let stream_num = operands[0] as i16;
                    match stream_num {
                        3 => {
                            // Select stream 3: divert subsequent output into
                            // the table named by the second operand, reserving
                            // its first word for the eventual length.
                            if let Some(&table_addr) = operands.get(1) {
                                if self.stream3_stack.len() >= 16 {
                                    debug!("output_stream 3: nesting limit of 16 reached, ignoring");
                                } else {
                                    self.stream3_stack.push((table_addr as u32, Vec::new()));
                                }
                            }
                        }
                        -3 => {
                            // Deselect the innermost stream-3 table: write its
                            // length word followed by the captured bytes.
                            if let Some((table_addr, buf)) = self.stream3_stack.pop() {
                                self.vm.write_word(table_addr, buf.len() as u16)?;
                                for (i, byte) in buf.iter().enumerate() {
                                    self.vm.write_byte(table_addr + 2 + i as u32, *byte)?;
                                }
                            } else {
                                debug!("output_stream -3: no active stream 3 table");
                            }
                        }
                        n if n.abs() == 1 => {
                            // Stream 1 (screen output) is always on; nothing to toggle.
                        }
                        _ => {
                            debug!("Unsupported output stream: {}", stream_num);
                        }
                    }
                }
                Ok(ExecutionResult::Continue)
            }
            0x0F => {
                // set_cursor - v3 uses this too (especially Seastalker)
                if operands.len() >= 2 {
                    let line = operands[0];
                    let column = operands[1];
                    self.io.command(IoCommand::SetCursor { line, column });
                }
                Ok(ExecutionResult::Continue)
            }
            0x11 => {
                // set_text_style
                // Style bits: 1=reverse, 2=bold, 4=italic, 8=fixed-pitch
                if !operands.is_empty() {
                    let style_bits = operands[0];
                    self.io.command(IoCommand::SetTextStyle { style_bits });
                }
                Ok(ExecutionResult::Continue)
            }
            0x15 => {
                // sound_effect - V3 only supports bleeps
                // Format: sound_effect number effect volume routine
                let number = operands.first().copied().unwrap_or(1);
                self.io.command(IoCommand::SoundEffect {
                    number,
                    effect: None,
                    volume: None,
                    routine: None,
                });
                Ok(ExecutionResult::Continue)
            }
            0x16 => {
                // read_char (V4+)
                if self.vm.game.header.version < 4 {
                    return Err(ZError::Internal("read_char is only available in V4+".to_string()));
                }

                // read_char has 1-3 operands:
                // 1. keyboard (1 = read from keyboard, must be 1)
                // 2. time (optional) - timeout in tenths of seconds
                // 3. routine (optional) - routine to call on timeout

                if operands.is_empty() || operands[0] != 1 {
                    return Err(ZError::Internal("read_char requires keyboard parameter = 1".to_string()));
                }

                let time = if operands.len() > 1 { operands[1] } else { 0 };
                let routine = if operands.len() > 2 { operands[2] } else { 0 };
                let has_timer = time > 0 && routine > 0;

                let char_code = match self.io.command(IoCommand::ReadChar) {
                    IoResult::Char(c) => c,
                    _ => 13,
                };

                if has_timer {
                    let _ = self.call_timer_routine(routine)?;
                }

                if let Some(store_var) = inst.store_var {
                    self.vm.write_variable(store_var, char_code)?;
                }

                Ok(ExecutionResult::Continue)
            }
            0x0C => {
                // call_vs2 (V4+) - like call, but up to 7 arguments
                if operands.is_empty() {
                    return Err(ZError::Internal("call_vs2 requires at least one operand".to_string()));
                }
                self.do_call(operands[0], &operands[1..], inst.store_var)?;
                Ok(ExecutionResult::Called)
            }
            0x0E => {
                // erase_line (V4+): only value 1 is defined (clear from cursor to end of line)
                self.io.command(IoCommand::EraseLine);
                Ok(ExecutionResult::Continue)
            }
            0x10 => {
                // get_cursor (V4+): writes row/column into the 2-word array given
                if let Some(&array_addr) = operands.first() {
                    if let IoResult::Cursor { row, column } = self.io.command(IoCommand::GetCursor) {
                        self.vm.write_word(array_addr as u32, row)?;
                        self.vm.write_word(array_addr as u32 + 2, column)?;
                    }
                }
                Ok(ExecutionResult::Continue)
            }
            0x12 => {
                // buffer_mode (V4+): controls line wrapping in the lower window.
                // No concrete terminal wrapping logic lives in the engine, so
                // this is a deliberate no-op acknowledged by the provider contract.
                Ok(ExecutionResult::Continue)
            }
            0x14 => {
                // input_stream (V3+): selects keyboard vs. script input. Only
                // the keyboard stream is modeled.
                Ok(ExecutionResult::Continue)
            }
            0x17 => {
                // scan_table (V4+): search an array of words/bytes for a value
                if operands.len() < 3 {
                    return Err(ZError::Internal("scan_table requires at least 3 operands".to_string()));
                }
                let x = operands[0];
                let table = operands[1] as u32;
                let len = operands[2];
                let form = operands.get(3).copied().unwrap_or(0x82);
                let entry_size = (form & 0x7F).max(1) as u32;
                let is_word = (form & 0x80) != 0;
                let count = len & 0x7FFF;

                let mut found_addr = 0u16;
                for i in 0..count as u32 {
                    let addr = table + i * entry_size;
                    let value = if is_word {
                        self.vm.read_word(addr)
                    } else {
                        self.vm.read_byte(addr) as u16
                    };
                    if value == x {
                        found_addr = addr as u16;
                        break;
                    }
                }

                if let Some(store_var) = inst.store_var {
                    self.vm.write_variable(store_var, found_addr)?;
                }
                self.do_branch(inst, found_addr != 0)
            }
            0x18 => {
                // not (V5+): bitwise complement, moved to VAR form here
                // (V1-4 spell this as 1OP:0x0F instead)
                if let Some(store_var) = inst.store_var {
                    let value = operands.first().copied().unwrap_or(0);
                    self.vm.write_variable(store_var, !value)?;
                }
                Ok(ExecutionResult::Continue)
            }
            0x19 => {
                // call_vn (V5+): call and discard the result
                if operands.is_empty() {
                    return Err(ZError::Internal("call_vn requires at least one operand".to_string()));
                }
                self.do_call(operands[0], &operands[1..], None)?;
                Ok(ExecutionResult::Called)
            }
            0x1A => {
                // call_vn2 (V5+): like call_vn, up to 7 arguments
                if operands.is_empty() {
                    return Err(ZError::Internal("call_vn2 requires at least one operand".to_string()));
                }
                self.do_call(operands[0], &operands[1..], None)?;
                Ok(ExecutionResult::Called)
            }
            0x1B => {
                // tokenise (V5+): re-run the lexer against an explicit text
                // buffer/parse buffer pair, optionally against a supplied
                // dictionary and without marking unrecognized words.
                if operands.len() < 2 {
                    return Err(ZError::Internal("tokenise requires at least 2 operands".to_string()));
                }
                self.vm.parse_text(operands[0] as u32, operands[1] as u32)?;
                Ok(ExecutionResult::Continue)
            }
            0x1C => {
                // encode_text (V5+): encode a substring of a buffer into
                // dictionary word format at the destination address.
                if operands.len() < 4 {
                    return Err(ZError::Internal("encode_text requires 4 operands".to_string()));
                }
                let zscii_text = operands[0] as u32;
                let length = operands[1] as usize;
                let from = operands[2] as usize;
                let dest = operands[3] as u32;

                let mut word = String::with_capacity(length);
                for i in 0..length {
                    word.push(self.vm.read_byte(zscii_text + (from + i) as u32) as char);
                }
                let encoded = crate::dictionary::encode_word(&word, self.vm.game.header.version);
                for (i, w) in encoded.iter().enumerate() {
                    self.vm.write_word(dest + (i as u32 * 2), *w)?;
                }
                Ok(ExecutionResult::Continue)
            }
            0x1D => {
                // copy_table (V5+): copy or zero a block of memory.
                // size > 0: copy first..first+size to second (non-overlapping
                //   semantics are not guaranteed, so copy low-to-high).
                // size < 0: copy even if source/dest overlap (force forward copy).
                // second == 0: zero out |size| bytes at first instead of copying.
                if operands.len() < 3 {
                    return Err(ZError::Internal("copy_table requires 3 operands".to_string()));
                }
                let first = operands[0] as u32;
                let second = operands[1] as u32;
                let size = operands[2] as i16;

                if second == 0 {
                    for i in 0..size.unsigned_abs() as u32 {
                        self.vm.write_byte(first + i, 0)?;
                    }
                } else if size < 0 {
                    // Forced forward copy, safe even when the regions overlap
                    // with second > first.
                    let len = (-size) as u32;
                    let bytes: Vec<u8> = (0..len).map(|i| self.vm.read_byte(first + i)).collect();
                    for (i, b) in bytes.into_iter().enumerate() {
                        self.vm.write_byte(second + i as u32, b)?;
                    }
                } else {
                    let len = size as u32;
                    if second > first && second < first + len {
                        // Overlapping forward copy: go back-to-front to avoid
                        // clobbering source bytes before they're read.
                        for i in (0..len).rev() {
                            let b = self.vm.read_byte(first + i);
                            self.vm.write_byte(second + i, b)?;
                        }
                    } else {
                        for i in 0..len {
                            let b = self.vm.read_byte(first + i);
                            self.vm.write_byte(second + i, b)?;
                        }
                    }
                }
                Ok(ExecutionResult::Continue)
            }
            0x1E => {
                // print_table (V5+): print a rectangular block of ZSCII text
                if operands.is_empty() {
                    return Err(ZError::Internal("print_table requires at least 1 operand".to_string()));
                }
                let table = operands[0] as u32;
                let width = operands.get(1).copied().unwrap_or(0) as u32;
                let height = operands.get(2).copied().unwrap_or(1) as u32;
                let skip = operands.get(3).copied().unwrap_or(0) as u32;

                for row in 0..height {
                    if row > 0 {
                        self.print(Window::Main, "\n");
                    }
                    let row_addr = table + row * (width + skip);
                    let mut line = String::with_capacity(width as usize);
                    for col in 0..width {
                        line.push(self.vm.read_byte(row_addr + col) as char);
                    }
                    self.print(Window::Main, &line);
                }
                Ok(ExecutionResult::Continue)
            }
            0x1F => {
                // check_arg_count (V5+): branch if the current routine was
                // called with at least `argument_number` arguments.
                let argument_number = operands.first().copied().unwrap_or(1);
                let supplied = self
                    .vm
                    .call_stack
                    .last()
                    .map(|f| f.arg_count as u16)
                    .unwrap_or(0);
                self.do_branch(inst, argument_number <= supplied)
            }
            _ => {
                let pc = self.vm.pc - inst.size as u32;
                debug!(
                    "Unimplemented VAR instruction: {:02x} at PC {:05x}",
                    inst.opcode, pc
                );
                Err(ZError::Internal(format!(
                    "Unimplemented VAR instruction: {:02x}",
                    inst.opcode
                )))
            }
        }
    }

    /// Execute EXT instructions
    fn execute_ext(
        &mut self,
        inst: &Instruction,
        operands: &[u16],
    ) -> Result<ExecutionResult, ZError> {
        let ext_opcode = inst.ext_opcode.unwrap_or(0);
        match ext_opcode {
            0x02 => {
                // log_shift: logical (unsigned) shift. Positive = left, negative = right.
                let number = operands[0];
                let places = operands[1] as i16;
                let result = if places >= 0 {
                    number.wrapping_shl(places as u32)
                } else {
                    number.wrapping_shr((-places) as u32)
                };
                if let Some(store_var) = inst.store_var {
                    self.vm.write_variable(store_var, result)?;
                }
                Ok(ExecutionResult::Continue)
            }
            0x03 => {
                // art_shift: arithmetic (sign-extending) shift.
                let number = operands[0] as i16;
                let places = operands[1] as i16;
                let result = if places >= 0 {
                    number.wrapping_shl(places as u32)
                } else {
                    number.wrapping_shr((-places) as u32)
                };
                if let Some(store_var) = inst.store_var {
                    self.vm.write_variable(store_var, result as u16)?;
                }
                Ok(ExecutionResult::Continue)
            }
            0x04 => {
                // set_font: store the previously active font (we only offer font 1).
                let font_id = operands.first().copied().unwrap_or(1);
                let previous = match self.io.command(IoCommand::SetFont { font_id: font_id as u8 }) {
                    IoResult::PreviousFont(f) => f as u16,
                    _ => 0,
                };
                if let Some(store_var) = inst.store_var {
                    self.vm.write_variable(store_var, previous)?;
                }
                Ok(ExecutionResult::Continue)
            }
            0x09 => {
                // save_undo: snapshot full VM state; store 1 (snapshot taken).
                let dynamic_size = self.vm.game.header.base_static_mem as usize;
                self.undo_snapshot = Some(UndoSnapshot {
                    dynamic_memory: self.vm.game.memory[..dynamic_size].to_vec(),
                    call_stack: self.vm.call_stack.clone(),
                    stack: self.vm.stack.clone(),
                    pc: self.vm.pc,
                    store_var: inst.store_var,
                });
                if let Some(store_var) = inst.store_var {
                    self.vm.write_variable(store_var, 1)?;
                }
                Ok(ExecutionResult::Continue)
            }
            0x0A => {
                // restore_undo: reinstate the last snapshot, or store -1 if none exists.
                match self.undo_snapshot.take() {
                    Some(snap) => {
                        let dynamic_size = snap.dynamic_memory.len();
                        self.vm.game.memory[..dynamic_size].copy_from_slice(&snap.dynamic_memory);
                        self.vm.call_stack = snap.call_stack;
                        self.vm.stack = snap.stack;
                        self.vm.pc = snap.pc;
                        if let Some(store_var) = snap.store_var {
                            self.vm.write_variable(store_var, 0)?;
                        }
                        Ok(ExecutionResult::Continue)
                    }
                    None => {
                        if let Some(store_var) = inst.store_var {
                            self.vm.write_variable(store_var, 0xFFFF)?;
                        }
                        Ok(ExecutionResult::Continue)
                    }
                }
            }
            0x0B => {
                // print_unicode: operand is a Unicode code point.
                let code_point = operands.first().copied().unwrap_or(0) as u32;
                if let Some(ch) = char::from_u32(code_point) {
                    self.print(Window::Main, &ch.to_string());
                }
                Ok(ExecutionResult::Continue)
            }
            0x0C => {
                // check_unicode: bit 0 = can print, bit 1 = can read as input.
                if let Some(store_var) = inst.store_var {
                    self.vm.write_variable(store_var, 0x03)?;
                }
                Ok(ExecutionResult::Continue)
            }
            _ => Err(ZError::Internal(format!(
                "Unimplemented EXT instruction: {ext_opcode:02x}"
            ))),
        }
    }

    /// Handle branching
    fn do_branch(
        &mut self,
        inst: &Instruction,
        condition: bool,
    ) -> Result<ExecutionResult, ZError> {
        if let Some(ref branch) = inst.branch {
            let should_branch = condition == branch.on_true;

            if should_branch {
                match branch.offset {
                    0 => return self.do_return(0), // rfalse
                    1 => return self.do_return(1), // rtrue
                    offset => {
                        // Jump is relative to instruction after branch data
                        let new_pc = (self.vm.pc as i32 + offset as i32 - 2) as u32;
                        self.vm.pc = new_pc;
                        return Ok(ExecutionResult::Branched);
                    }
                }
            }
        }
        Ok(ExecutionResult::Continue)
    }

    /// Read a single character with optional timeout
    /// Get the name of an object (version-aware; delegates to the VM's
    /// object-table implementation rather than duplicating its layout math).
    fn get_object_name(&self, obj_num: u16) -> Result<String, ZError> {
        self.vm.get_object_name(obj_num).map_err(ZError::Internal)
    }

    /// Serialize the current VM state to Quetzal and hand it to the I/O
    /// provider's `Save` command. Returns whether the provider accepted it.
    fn do_save(&mut self) -> bool {
        let pc_after_save = self.vm.pc;
        let save = match crate::quetzal::save::SaveGame::from_vm(&self.vm, pc_after_save) {
            Ok(s) => s,
            Err(e) => {
                debug!("save: failed to build Quetzal image: {e}");
                return false;
            }
        };
        match self.io.command(IoCommand::Save {
            file_data: save.to_bytes(),
        }) {
            IoResult::Saved(ok) => ok,
            _ => false,
        }
    }

    /// Ask the I/O provider for a previously saved Quetzal image and restore
    /// it into the VM. Returns whether the restore succeeded.
    fn do_restore(&mut self) -> bool {
        let data = match self.io.command(IoCommand::Restore) {
            IoResult::Restored(Some(data)) => data,
            _ => return false,
        };
        let restore = match crate::quetzal::restore::RestoreGame::from_bytes(&data) {
            Ok(r) => r,
            Err(e) => {
                debug!("restore: failed to parse Quetzal image: {e}");
                return false;
            }
        };
        if let Err(e) = restore.restore_to_vm(&mut self.vm) {
            debug!("restore: failed to apply Quetzal image: {e}");
            return false;
        }
        if let Ok(pc) = restore.resume_pc() {
            self.vm.pc = pc;
        }
        true
    }

    /// Handle routine calls
    /// Call a timer routine and execute it to completion
    fn call_timer_routine(&mut self, routine_addr: u16) -> Result<bool, ZError> {
        debug!("Calling timer routine at 0x{:04x}", routine_addr);

        // Save current PC and call depth
        let _saved_pc = self.vm.pc;
        let saved_call_depth = self.vm.call_depth();

        // Call routine with 0 args, store result in temp variable (stack)
        self.do_call(routine_addr, &[], Some(0))?;

        // Execute until routine returns (when call depth returns to saved level)
        let mut return_value = 0;
        let mut instruction_count = 0;
        const MAX_TIMER_INSTRUCTIONS: u64 = 10000; // Safety limit

        while self.vm.call_depth() > saved_call_depth {
            instruction_count += 1;
            if instruction_count > MAX_TIMER_INSTRUCTIONS {
                return Err(ZError::Internal("Timer routine exceeded instruction limit".to_string()));
            }

            // Fetch and decode instruction
            let pc = self.vm.pc;
            let inst = match Instruction::decode(
                &self.vm.game.memory,
                pc as usize,
                self.vm.game.header.version,
            ) {
                Ok(inst) => inst,
                Err(e) => return Err(ZError::Internal(format!("Error decoding instruction at {pc:05x}: {e}"))),
            };

            // Update PC
            self.vm.pc += inst.size as u32;

            // Execute instruction
            match self.execute_instruction(&inst)? {
                ExecutionResult::Returned(value) => {
                    return_value = value;
                    if self.vm.call_depth() <= saved_call_depth {
                        break;
                    }
                }
                ExecutionResult::Quit | ExecutionResult::GameOver => {
                    return Err(ZError::Internal("Timer routine tried to quit/end game".to_string()));
                }
                _ => {
                    // Continue executing
                }
            }
        }

        // Pop the return value from stack (since we stored to var 0)
        let _ = self.vm.pop();

        debug!("Timer routine returned: {}", return_value);

        // Return true if routine wants to terminate input
        Ok(return_value != 0)
    }

    fn do_call(
        &mut self,
        packed_addr: u16,
        args: &[u16],
        return_store: Option<u8>,
    ) -> Result<(), ZError> {
        // Special case: calling address 0 returns false
        if packed_addr == 0 {
            if let Some(var) = return_store {
                self.vm.write_variable(var, 0)?;
            }
            return Ok(());
        }

        // Unpack the address
        let addr = self.unpack_routine_address(packed_addr) as u32;

        if self.debug {
            debug!("CALL to 0x{:05x} with args: {:?}", addr, args);
        }

        // Save current state
        let frame = CallFrame {
            return_pc: self.vm.pc,
            return_store,
            num_locals: 0, // Will be set when we read routine header
            locals: [0; 16],
            stack_base: self.vm.stack.len(),
            arg_count: args.len().min(crate::vm::MAX_LOCALS) as u8,
        };
        debug!(
            "Creating call frame with return_store={:?}, stack_base={}",
            return_store,
            self.vm.stack.len()
        );

        // Read routine header
        let mut num_locals = self.vm.read_byte(addr) as usize;
        if num_locals > 15 {
            debug!(
                "Routine at {:05x} claims {} locals - clamping to 15",
                addr, num_locals
            );
            // Some games have corrupt headers or use this byte for other purposes
            // Clamp to 15 locals for V3
            num_locals = 15;
        }

        let mut new_frame = frame;
        new_frame.num_locals = num_locals as u8;

        // Set PC to start of routine code
        self.vm.pc = addr + 1;

        // Initialize locals
        if self.vm.game.header.version <= 4 {
            // V1-4: Read initial values from routine header
            for i in 0..num_locals {
                let value = self.vm.read_word(self.vm.pc);
                new_frame.locals[i] = value;
                self.vm.pc += 2;
            }

            // CRITICAL: Arguments overwrite the first N locals in V1-4
            // This is the key part that was missing!
            for (i, &arg) in args.iter().enumerate() {
                if i < num_locals {
                    new_frame.locals[i] = arg;
                }
            }
        } else {
            // V5+: Initialize to zero, except for arguments
            new_frame.locals[..num_locals.min(args.len())]
                .copy_from_slice(&args[..num_locals.min(args.len())]);
        }

        // Push the call frame
        self.vm.call_stack.push(new_frame);

        Ok(())
    }

    /// Handle routine returns
    fn do_return(&mut self, value: u16) -> Result<ExecutionResult, ZError> {
        // Pop the call frame
        let frame = self
            .vm
            .call_stack
            .pop()
            .ok_or("Return with empty call stack")?;

        debug!(
            "Returning from routine: value={}, return_pc={:05x}",
            value, frame.return_pc
        );

        // Restore PC
        self.vm.pc = frame.return_pc;

        // Restore stack
        debug!(
            "Stack before truncate: len={}, base={}",
            self.vm.stack.len(),
            frame.stack_base
        );
        self.vm.stack.truncate(frame.stack_base);

        // Store return value if needed
        if let Some(var) = frame.return_store {
            debug!("Storing return value {} to variable {}", value, var);
            self.vm.write_variable(var, value)?;
            debug!("Stack len after store: {}", self.vm.stack.len());
        }

        // Check if we're back at main
        if self.vm.call_stack.is_empty() {
            return Ok(ExecutionResult::GameOver);
        }

        Ok(ExecutionResult::Returned(value))
    }

    /// Unpack a routine address based on version
    fn unpack_routine_address(&self, packed: u16) -> usize {
        let header = &self.vm.game.header;
        match header.version {
            1..=3 => (packed as usize) * 2,
            4..=5 => (packed as usize) * 4,
            7 => (packed as usize) * 4 + header.routines_offset as usize * 8,
            8 => (packed as usize) * 8,
            _ => (packed as usize) * 4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::headless::HeadlessIoProvider;
    use crate::vm::Game;

    fn create_test_interpreter() -> Interpreter {
        let mut memory = vec![0u8; 0x10000];

        // Set up header
        memory[0x00] = 3; // Version 3
        memory[0x04] = 0x10; // High memory at 0x1000
        memory[0x05] = 0x00;
        memory[0x06] = 0x50; // Initial PC at 0x5000
        memory[0x07] = 0x00;
        memory[0x0c] = 0x01; // Global table at 0x0100
        memory[0x0d] = 0x00;
        memory[0x0e] = 0x02; // Static memory at 0x0200
        memory[0x0f] = 0x00;

        // Add a simple program at 0x5000: push 42, pop, quit
        memory[0x5000] = 0xE8; // VAR:OP1 push
        memory[0x5001] = 0x7F; // Operand types: small constant (01), then omitted
        memory[0x5002] = 0x2A; // Value: 42

        memory[0x5003] = 0xB9; // 0OP pop

        memory[0x5004] = 0xBA; // 0OP quit

        let game = Game::from_memory(memory).unwrap();
        let vm = VM::new(game);
        Interpreter::new(vm, Box::new(HeadlessIoProvider::new()))
    }

    #[test]
    fn test_simple_execution() {
        let mut interp = create_test_interpreter();

        // Execute push instruction
        let inst = Instruction::decode(&interp.vm.game.memory, 0x5000, 3).unwrap();
        interp.vm.pc = 0x5003; // Advance past instruction
        let result = interp.execute_instruction(&inst).unwrap();
        assert!(matches!(result, ExecutionResult::Continue));
        assert_eq!(interp.vm.stack.len(), 1);
        assert_eq!(interp.vm.stack[0], 42);

        // Execute pop instruction
        let inst = Instruction::decode(&interp.vm.game.memory, 0x5003, 3).unwrap();
        interp.vm.pc = 0x5004;
        let result = interp.execute_instruction(&inst).unwrap();
        assert!(matches!(result, ExecutionResult::Continue));
        assert_eq!(interp.vm.stack.len(), 0);

        // Execute quit instruction
        let inst = Instruction::decode(&interp.vm.game.memory, 0x5004, 3).unwrap();
        let result = interp.execute_instruction(&inst).unwrap();
        assert!(matches!(result, ExecutionResult::Quit));
    }

    #[test]
    fn test_arithmetic() {
        let mut interp = create_test_interpreter();

        // Test add instruction - use a global variable for storage
        let memory = vec![
            0x14, // Long form, add, both small constants (00 01 0100)
            0x0A, // Constant 10
            0x20, // Constant 32
            0x10, // Store to global variable 0x10
        ];

        let inst = Instruction::decode(&memory, 0, 3).unwrap();
        // Set PC past the instruction (simulating that it was fetched)
        interp.vm.pc = inst.size as u32;
        let result = interp.execute_instruction(&inst).unwrap();
        assert!(matches!(result, ExecutionResult::Continue));
        // Check that global variable 0x10 now contains 42
        assert_eq!(interp.vm.read_global(0x10).unwrap(), 42);
    }
}
