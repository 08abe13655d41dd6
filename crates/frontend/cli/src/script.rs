//! JSON probe scripts
//!
//! A script is a list of steps run in order against one task. Registers
//! carry over from step to step the way they would in a real program; each
//! step only overrides the registers it names.

use anyhow::{bail, Context, Result};
use emu_core::{FarPtr, GuestMemory};
use emu_dos::{eflags, DosTask, HeadlessCpu, NativeContext};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Script {
    pub steps: Vec<Step>,
}

impl Script {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading script {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing script {}", path.display()))
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case", deny_unknown_fields)]
pub enum Step {
    /// INT 31h from protected mode
    Int31 {
        #[serde(default)]
        regs: Registers,
    },
    /// INT 2Fh multiplex call from real mode
    Int2f {
        #[serde(default)]
        regs: Registers,
    },
    /// Far call into the XMS driver entry
    Xms {
        #[serde(default)]
        regs: Registers,
    },
    /// Far call into the protected-mode entry returned by INT 2Fh AX=1687h
    EnterProtectedMode {
        #[serde(default)]
        bits32: bool,
        #[serde(default = "default_stack_segment")]
        stack_segment: u16,
        #[serde(default = "default_code_segment")]
        code_segment: u16,
    },
    /// Store bytes at a linear address
    Write { address: u32, bytes: Vec<u8> },
    /// Print bytes at a linear address
    Dump { address: u32, length: u32 },
}

fn default_stack_segment() -> u16 {
    0x2000
}

fn default_code_segment() -> u16 {
    0x3000
}

/// Register overrides for a step
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Registers {
    pub eax: Option<u32>,
    pub ebx: Option<u32>,
    pub ecx: Option<u32>,
    pub edx: Option<u32>,
    pub esi: Option<u32>,
    pub edi: Option<u32>,
    pub ebp: Option<u32>,
    pub esp: Option<u32>,
    pub ds: Option<u16>,
    pub es: Option<u16>,
    pub fs: Option<u16>,
    pub gs: Option<u16>,
    pub ss: Option<u16>,
}

impl Registers {
    fn apply(&self, ctx: &mut NativeContext) {
        let dwords = [
            (self.eax, &mut ctx.eax),
            (self.ebx, &mut ctx.ebx),
            (self.ecx, &mut ctx.ecx),
            (self.edx, &mut ctx.edx),
            (self.esi, &mut ctx.esi),
            (self.edi, &mut ctx.edi),
            (self.ebp, &mut ctx.ebp),
            (self.esp, &mut ctx.esp),
        ];
        for (value, reg) in dwords {
            if let Some(value) = value {
                *reg = value;
            }
        }
        let words = [
            (self.ds, &mut ctx.ds),
            (self.es, &mut ctx.es),
            (self.fs, &mut ctx.fs),
            (self.gs, &mut ctx.gs),
            (self.ss, &mut ctx.ss),
        ];
        for (value, reg) in words {
            if let Some(value) = value {
                *reg = value;
            }
        }
    }
}

/// Outcome of one step
#[derive(Debug, Serialize)]
pub struct StepReport {
    pub step: usize,
    pub op: &'static str,
    pub regs: NativeContext,
    pub carry: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes: Option<Vec<u8>>,
}

impl std::fmt::Display for StepReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let r = &self.regs;
        write!(
            f,
            "#{:<3} {:<20} EAX={:08X} EBX={:08X} ECX={:08X} EDX={:08X} ESI={:08X} EDI={:08X} \
             CS={:04X} DS={:04X} ES={:04X} SS={:04X} ESP={:08X} CF={}",
            self.step,
            self.op,
            r.eax,
            r.ebx,
            r.ecx,
            r.edx,
            r.esi,
            r.edi,
            r.cs,
            r.ds,
            r.es,
            r.ss,
            r.esp,
            self.carry as u8
        )?;
        if let Some(bytes) = &self.bytes {
            write!(f, "\n     ")?;
            for byte in bytes {
                write!(f, " {:02X}", byte)?;
            }
        }
        Ok(())
    }
}

/// Runs scripts against a task with a headless CPU
pub struct Runner {
    pub task: DosTask,
    pub cpu: HeadlessCpu,
    /// Protected-mode register state carried between steps
    ctx: NativeContext,
}

impl Runner {
    pub fn new(task: DosTask) -> Self {
        Self {
            task,
            cpu: HeadlessCpu::new(),
            ctx: NativeContext::default(),
        }
    }

    pub fn run(&mut self, script: &Script) -> Result<Vec<StepReport>> {
        script
            .steps
            .iter()
            .enumerate()
            .map(|(index, step)| {
                self.run_step(index, step)
                    .with_context(|| format!("step {}", index))
            })
            .collect()
    }

    fn run_step(&mut self, index: usize, step: &Step) -> Result<StepReport> {
        let mut bytes = None;
        let op = match step {
            Step::Int31 { regs } => {
                regs.apply(&mut self.ctx);
                self.ctx.eflags &= !eflags::VM;
                log::debug!("INT 31h AX={:04X}", self.ctx.ax());
                self.task.handle_int31(&mut self.ctx, &mut self.cpu)?;
                "int31"
            }
            Step::Int2f { regs } => {
                let mut rm = self.real_mode_context(regs);
                if !self.task.handle_int2f(&mut rm) {
                    log::warn!("INT 2Fh AX={:04X} is not handled by the extender", rm.ax());
                }
                self.ctx = rm;
                "int2f"
            }
            Step::Xms { regs } => {
                let mut rm = self.real_mode_context(regs);
                rm.cs = self.task.segments().xms_seg;
                rm.eip = 2;
                self.task.handle_int31(&mut rm, &mut self.cpu)?;
                self.ctx = rm;
                "xms"
            }
            Step::EnterProtectedMode {
                bits32,
                stack_segment,
                code_segment,
            } => {
                self.enter_protected_mode(*bits32, *stack_segment, *code_segment)?;
                "enter_protected_mode"
            }
            Step::Write { address, bytes: data } => {
                self.task.guest_memory().write_bytes(*address, data);
                "write"
            }
            Step::Dump { address, length } => {
                let mut buf = vec![0u8; *length as usize];
                self.task.guest_memory().read_bytes(*address, &mut buf);
                bytes = Some(buf);
                "dump"
            }
        };

        Ok(StepReport {
            step: index,
            op,
            regs: self.ctx,
            carry: self.ctx.carry(),
            bytes,
        })
    }

    fn real_mode_context(&self, regs: &Registers) -> NativeContext {
        let mut rm = NativeContext {
            eflags: self.ctx.eflags | eflags::VM,
            ..self.ctx
        };
        regs.apply(&mut rm);
        rm
    }

    /// Far call from `code_segment:0000` into the DPMI entry, then the
    /// stub's far return back to the caller
    fn enter_protected_mode(&mut self, bits32: bool, stack: u16, code: u16) -> Result<()> {
        let entry = self.task.segments().dpmi_seg;
        let sp: u16 = 0xFFF0;
        let frame = FarPtr::new(stack, sp).linear();
        let mut memory = self.task.guest_memory();
        memory.write_u16(frame, 0);
        memory.write_u16(frame + 2, code);

        let mut rm = NativeContext::real_mode(entry, 2);
        rm.ss = stack;
        rm.ds = stack;
        rm.esp = sp as u32;
        rm.set_ax(bits32 as u16);
        self.task.handle_int31(&mut rm, &mut self.cpu)?;
        if rm.carry() {
            bail!("protected mode entry refused");
        }

        // Pop the far return the stub would execute
        let frame = self.task.linear_address(&rm, rm.ss, rm.esp)?;
        let memory = self.task.guest_memory();
        if bits32 {
            rm.eip = memory.read_u32(frame);
            rm.cs = memory.read_u32(frame + 4) as u16;
            rm.esp = rm.esp.wrapping_add(8);
        } else {
            rm.eip = memory.read_u16(frame) as u32;
            rm.cs = memory.read_u16(frame + 2);
            rm.esp = rm.esp.wrapping_add(4);
        }
        log::info!(
            "entered {}-bit protected mode at {:04X}:{:08X}",
            if bits32 { 32 } else { 16 },
            rm.cs,
            rm.eip
        );
        self.ctx = rm;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use emu_dos::DpmiConfig;

    fn runner() -> Runner {
        Runner::new(DosTask::new(DpmiConfig::default()).unwrap())
    }

    #[test]
    fn test_parse_script() {
        let script: Script = serde_json::from_str(
            r#"{"steps": [
                {"op": "int31", "regs": {"eax": 1024}},
                {"op": "enter_protected_mode", "bits32": true},
                {"op": "dump", "address": 1024, "length": 4}
            ]}"#,
        )
        .unwrap();
        assert_eq!(script.steps.len(), 3);
        assert!(matches!(
            script.steps[1],
            Step::EnterProtectedMode {
                bits32: true,
                stack_segment: 0x2000,
                code_segment: 0x3000
            }
        ));
    }

    #[test]
    fn test_unknown_register_rejected() {
        let result: Result<Script, _> =
            serde_json::from_str(r#"{"steps": [{"op": "int31", "regs": {"rax": 1}}]}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_registers_carry_over() {
        let mut runner = runner();
        let script: Script = serde_json::from_str(
            r#"{"steps": [
                {"op": "int31", "regs": {"eax": 0, "ecx": 1}},
                {"op": "int31", "regs": {"eax": 3}}
            ]}"#,
        )
        .unwrap();
        let reports = runner.run(&script).unwrap();
        assert_eq!(reports[0].regs.cx(), 1);
        assert_eq!(reports[1].regs.ax(), 8);
        assert_eq!(reports[1].regs.cx(), 1);
    }

    #[test]
    fn test_enter_protected_mode_lands_on_caller() {
        let mut runner = runner();
        let script: Script =
            serde_json::from_str(r#"{"steps": [{"op": "enter_protected_mode"}]}"#).unwrap();
        let reports = runner.run(&script).unwrap();
        let regs = reports[0].regs;
        assert!(!reports[0].carry);
        assert_eq!(regs.eip, 0);
        assert_eq!(runner.task.ldt().base(regs.cs), Ok(0x30000));
        assert_eq!(regs.esp, 0xFFF4);
    }

    #[test]
    fn test_xms_version() {
        let mut runner = runner();
        let script: Script =
            serde_json::from_str(r#"{"steps": [{"op": "xms", "regs": {"eax": 0}}]}"#).unwrap();
        let reports = runner.run(&script).unwrap();
        assert_eq!(reports[0].regs.ax(), 0x0200);
    }

    #[test]
    fn test_dump_reads_back_write() {
        let mut runner = runner();
        let script: Script = serde_json::from_str(
            r#"{"steps": [
                {"op": "write", "address": 20480, "bytes": [1, 2, 3]},
                {"op": "dump", "address": 20480, "length": 3}
            ]}"#,
        )
        .unwrap();
        let reports = runner.run(&script).unwrap();
        assert_eq!(reports[1].bytes.as_deref(), Some(&[1u8, 2, 3][..]));
    }
}
