//! The x86-64 System V instruction/operand model.
//!
//! This module is a small assembler-level algebra, not a register allocator
//! or an expression compiler (see `back::codegen` for those): a [`Register`]
//! enum, an [`Operand`] enum covering the three operand shapes the emitter
//! ever needs (immediate, register, register+offset memory), an
//! [`Instruction`] enum with a `Display` impl that renders GAS/AT&T syntax,
//! and a handful of "smart constructors" (`mov`, `add`, `sub`, `imul`,
//! `idiv`, `cmp`, `push`, `pop`) that encode the x86 operand-encoding
//! constraints the teacher's `compile.c` enforces by hand: no memory-memory
//! operands, 64-bit immediates outside signed-32-bit range routed through a
//! scratch register, and `imul`/`idiv` specializations.
//!
//! # Calling convention
//!
//! `basic_main` is called with no arguments and returns nothing; it is
//! linked against a runtime providing `print_int(long)` (System V: the
//! argument arrives in `%rdi`). There is only ever one "function" in a
//! compiled program, so there is no general call/return convention to model
//! here beyond the one call site `PRINT` uses.
//!
//! ## Registers
//!
//! Sixteen general-purpose registers participate in register allocation and
//! expression evaluation (`%rsp` is reserved for the stack pointer and never
//! handed out). Per `spec.md` §4.3/§4.4:
//!
//! - **Variable-eligible (callee-saved):** `rbx, rbp, r12, r13, r14, r15, r8,
//!   r9, r10` — the nine registers a hot variable can live in for the whole
//!   compilation.
//! - **Temporary-eligible:** all sixteen, with `rdi`/`rsi` as the fallback
//!   pair once every register is busy.
//! - **Reserved:** `rax` (division result), `rcx` (memory-memory/immediate
//!   decomposition scratch), `rdx` (division remainder via `cqo`), `rsp`
//!   (stack pointer), `r11` (the "clone register" used for self-referential
//!   `LET`).
#![allow(dead_code)]

use derive_more::Display;

/// A general-purpose x86-64 register, named as in `compile.c`'s `reg_t`.
#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub enum Register {
    #[display("rdi")]
    Rdi,
    #[display("rsi")]
    Rsi,
    #[display("rbx")]
    Rbx,
    #[display("rbp")]
    Rbp,
    #[display("r12")]
    R12,
    #[display("r13")]
    R13,
    #[display("r14")]
    R14,
    #[display("r15")]
    R15,
    #[display("r8")]
    R8,
    #[display("r9")]
    R9,
    #[display("r10")]
    R10,
    #[display("r11")]
    R11,
    #[display("rax")]
    Rax,
    #[display("rcx")]
    Rcx,
    #[display("rdx")]
    Rdx,
    #[display("rsp")]
    Rsp,
}

impl Register {
    /// All sixteen real registers, in `REG_NAME_MAP`'s order. Used by the
    /// temporary-register scan in `codegen::Emitter::request_register`.
    pub const ALL: [Register; 16] = [
        Register::Rdi,
        Register::Rsi,
        Register::Rbx,
        Register::Rbp,
        Register::R12,
        Register::R13,
        Register::R14,
        Register::R15,
        Register::R8,
        Register::R9,
        Register::R10,
        Register::R11,
        Register::Rax,
        Register::Rcx,
        Register::Rdx,
        Register::Rsp,
    ];

    /// The nine callee-saved registers a variable may be assigned to, in
    /// the fixed priority order of `spec.md` §4.3.
    pub const VAR_POOL: [Register; 9] = [
        Register::Rbx,
        Register::Rbp,
        Register::R12,
        Register::R13,
        Register::R14,
        Register::R15,
        Register::R8,
        Register::R9,
        Register::R10,
    ];

    /// Registers never handed out by `request_register`: taken permanently
    /// by a fixed role (division, stack, scratch, clone).
    pub fn is_reserved(self) -> bool {
        matches!(
            self,
            Register::Rax | Register::Rcx | Register::Rdx | Register::Rsp | Register::R11
        )
    }

    /// Callee-saved registers, in the order the prologue pushes them and
    /// the epilogue pops them (reverse).
    pub const CALLEE_SAVED: [Register; 6] = [
        Register::Rbx,
        Register::Rbp,
        Register::R12,
        Register::R13,
        Register::R14,
        Register::R15,
    ];
}

/// An operand to an instruction: an immediate, a register, or a
/// register-plus-offset memory location (`asm_op_t` in `compile.c`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operand {
    Imm(i64),
    Reg(Register),
    /// `offset(%base)`.
    Mem { base: Register, offset: i64 },
}

impl Operand {
    pub fn is_mem(&self) -> bool {
        matches!(self, Operand::Mem { .. })
    }

    pub fn is_imm(&self) -> bool {
        matches!(self, Operand::Imm(_))
    }

    /// `can_represent_as_32bit`: whether this value fits as a 32-bit
    /// sign-extended immediate, the threshold x86 uses for an immediate
    /// operand to a `q`-suffixed instruction.
    pub fn fits_imm32(v: i64) -> bool {
        i32::try_from(v).is_ok()
    }
}

impl std::fmt::Display for Operand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operand::Imm(v) => write!(f, "${v}"),
            Operand::Reg(r) => write!(f, "%{r}"),
            Operand::Mem { base, offset } => write!(f, "{offset}(%{base})"),
        }
    }
}

/// A single line of emitted x86-64 assembly.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Instruction {
    Movq { src: Operand, dst: Operand },
    Addq { src: Operand, dst: Operand },
    Subq { src: Operand, dst: Operand },
    Imulq { src: Operand, dst: Register },
    Shlq { amount: u8, dst: Register },
    Negq { dst: Register },
    Idivq { src: Operand },
    Cqo,
    Cmpq { src: Operand, dst: Operand },
    Push(Operand),
    Pop(Operand),
    Jmp(String),
    Jle(String),
    Jge(String),
    Jne(String),
    Call(String),
    Ret,
    Label(String),
    /// A `# comment` line, used the way `compile.c` sprinkles
    /// `fprintf(outputfile, "# ...")` diagnostics into the generated text.
    Comment(String),
}

impl std::fmt::Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use Instruction::*;
        match self {
            Movq { src, dst } => write!(f, "\tmovq {src}, {dst}"),
            Addq { src, dst } => write!(f, "\taddq {src}, {dst}"),
            Subq { src, dst } => write!(f, "\tsubq {src}, {dst}"),
            Imulq { src, dst } => write!(f, "\timulq {src}, %{dst}"),
            Shlq { amount, dst } => write!(f, "\tshlq ${amount}, %{dst}"),
            Negq { dst } => write!(f, "\tnegq %{dst}"),
            Idivq { src } => write!(f, "\tidivq {src}"),
            Cqo => write!(f, "\tcqo"),
            Cmpq { src, dst } => write!(f, "\tcmpq {src}, {dst}"),
            Push(op) => write!(f, "\tpush {op}"),
            Pop(op) => write!(f, "\tpop {op}"),
            Jmp(l) => write!(f, "\tjmp {l}"),
            Jle(l) => write!(f, "\tjle {l}"),
            Jge(l) => write!(f, "\tjge {l}"),
            Jne(l) => write!(f, "\tjne {l}"),
            Call(l) => write!(f, "\tcall {l}"),
            Ret => write!(f, "\tret"),
            Label(l) => write!(f, "{l}:"),
            Comment(s) => write!(f, "\t# {s}"),
        }
    }
}

/// `is_power_of_two`, used by the `imul`-to-`shl` specialization.
fn is_power_of_two(v: i64) -> bool {
    v != 0 && (v & (v - 1)) == 0
}

/// `compute_log_2`, the shift amount for a power-of-two `imul` immediate.
fn log2(v: i64) -> u8 {
    v.trailing_zeros() as u8
}

/// `mov src, dst`. A no-op when `src == dst` (`same_asm_ops` in
/// `compile.c`). Memory-to-memory and out-of-`i32`-range-immediate-to-memory
/// moves are decomposed through `%rcx`.
pub fn mov(src: Operand, dst: Operand) -> Vec<Instruction> {
    debug_assert!(!dst.is_imm(), "cannot mov into an immediate");
    if src == dst {
        return Vec::new();
    }
    if dst.is_mem() && (src.is_mem() || matches!(src, Operand::Imm(v) if !Operand::fits_imm32(v)))
    {
        let mut out = mov(src, Operand::Reg(Register::Rcx));
        out.extend(mov(Operand::Reg(Register::Rcx), dst));
        return out;
    }
    vec![Instruction::Movq { src, dst }]
}

/// `add src, dst`. A 64-bit immediate outside `i32` range is staged through
/// `%rcx` first, since `addq` only has a 32-bit-immediate encoding.
pub fn add(src: Operand, dst: Operand) -> Vec<Instruction> {
    debug_assert!(!dst.is_imm());
    debug_assert!(!(src.is_mem() && dst.is_mem()));
    if let Operand::Imm(v) = src {
        if !Operand::fits_imm32(v) {
            let mut out = mov(src, Operand::Reg(Register::Rcx));
            out.extend(add(Operand::Reg(Register::Rcx), dst));
            return out;
        }
    }
    vec![Instruction::Addq { src, dst }]
}

/// `sub src, dst`, staged through `%rcx` on the same terms as [`add`].
pub fn sub(src: Operand, dst: Operand) -> Vec<Instruction> {
    debug_assert!(!dst.is_imm());
    debug_assert!(!(src.is_mem() && dst.is_mem()));
    if let Operand::Imm(v) = src {
        if !Operand::fits_imm32(v) {
            let mut out = mov(src, Operand::Reg(Register::Rcx));
            out.extend(sub(Operand::Reg(Register::Rcx), dst));
            return out;
        }
    }
    vec![Instruction::Subq { src, dst }]
}

/// `dst = dst * src`. `imulq`'s destination is always a register on x86, so
/// unlike `add`/`sub`/`cmp` this never takes a memory destination. Constant
/// multipliers are specialized: `-1` becomes `neg`, a power of two becomes
/// `shl`, and an in-range constant uses the three-operand `imulq $c, src,
/// dst` form (here folded to the two-operand `imulq $c, dst` since `src` and
/// `dst` already agree going in, mirroring `compile.c`'s usage).
pub fn imul(src: Operand, dst: Register) -> Vec<Instruction> {
    match src {
        Operand::Imm(v) if v == -1 => vec![Instruction::Negq { dst }],
        Operand::Imm(v) if is_power_of_two(v) => vec![Instruction::Shlq {
            amount: log2(v),
            dst,
        }],
        Operand::Imm(v) if !Operand::fits_imm32(v) => {
            let mut out = mov(src, Operand::Reg(Register::Rcx));
            out.extend(imul(Operand::Reg(Register::Rcx), dst));
            out
        }
        _ => vec![Instruction::Imulq { src, dst }],
    }
}

/// `dividend / src`, leaving the quotient wherever `dest` names (usually
/// `%rax` itself, sometimes a fresh temp or a variable's home). Always
/// routes through `cqo`/`idivq`/`%rax` since x86 has no register-to-register
/// division; an immediate divisor is staged through `%rcx` since `idivq`
/// has no immediate-operand form at all.
pub fn idiv(src: Operand, dividend: Operand, dest: Operand) -> Vec<Instruction> {
    debug_assert!(!dest.is_imm());
    let mut out = mov(dividend, Operand::Reg(Register::Rax));
    out.push(Instruction::Cqo);
    match src {
        Operand::Imm(_) => {
            out.extend(mov(src, Operand::Reg(Register::Rcx)));
            out.push(Instruction::Idivq {
                src: Operand::Reg(Register::Rcx),
            });
        }
        _ => out.push(Instruction::Idivq { src }),
    }
    out.extend(mov(Operand::Reg(Register::Rax), dest));
    out
}

/// `cmp src, dst` evaluates `dst - src` and sets flags; per
/// `codegen::compile_condition`'s canonicalization `src` (the right-hand
/// side of the source comparison) is never a constant, and only `dst` may
/// be one (staged through `%rcx` if it does not fit 32 bits).
pub fn cmp(src: Operand, dst: Operand) -> Vec<Instruction> {
    debug_assert!(!src.is_imm(), "comparator rhs is canonicalized off const");
    debug_assert!(!(src.is_mem() && dst.is_mem()));
    if let Operand::Imm(v) = dst {
        if !Operand::fits_imm32(v) {
            let mut out = mov(dst, Operand::Reg(Register::Rcx));
            out.extend(cmp(src, Operand::Reg(Register::Rcx)));
            return out;
        }
    }
    vec![Instruction::Cmpq { src, dst }]
}

pub fn push(src: Operand) -> Instruction {
    debug_assert!(!src.is_imm());
    Instruction::Push(src)
}

pub fn pop(dst: Operand) -> Instruction {
    debug_assert!(!dst.is_imm());
    Instruction::Pop(dst)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mov_same_operand_is_elided() {
        assert!(mov(Operand::Reg(Register::Rax), Operand::Reg(Register::Rax)).is_empty());
    }

    #[test]
    fn mov_mem_to_mem_routes_through_rcx() {
        let a = Operand::Mem {
            base: Register::Rsp,
            offset: 0,
        };
        let b = Operand::Mem {
            base: Register::Rsp,
            offset: 8,
        };
        let instrs = mov(a, b);
        assert_eq!(instrs.len(), 2);
        assert!(matches!(
            instrs[0],
            Instruction::Movq {
                dst: Operand::Reg(Register::Rcx),
                ..
            }
        ));
    }

    #[test]
    fn imul_by_power_of_two_becomes_shift() {
        let instrs = imul(Operand::Imm(8), Register::Rbx);
        assert_eq!(
            instrs,
            vec![Instruction::Shlq {
                amount: 3,
                dst: Register::Rbx
            }]
        );
    }

    #[test]
    fn imul_by_minus_one_becomes_neg() {
        let instrs = imul(Operand::Imm(-1), Register::Rbx);
        assert_eq!(instrs, vec![Instruction::Negq { dst: Register::Rbx }]);
    }

    #[test]
    fn idiv_by_immediate_stages_through_rcx() {
        let instrs = idiv(
            Operand::Imm(5),
            Operand::Reg(Register::Rbx),
            Operand::Reg(Register::Rbx),
        );
        assert!(instrs.iter().any(|i| matches!(
            i,
            Instruction::Idivq {
                src: Operand::Reg(Register::Rcx)
            }
        )));
    }

    #[test]
    fn large_immediate_add_stages_through_rcx() {
        let instrs = add(Operand::Imm(1 << 40), Operand::Reg(Register::Rbx));
        assert!(matches!(
            instrs[0],
            Instruction::Movq {
                dst: Operand::Reg(Register::Rcx),
                ..
            }
        ));
    }
}
