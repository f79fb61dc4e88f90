//! x86_64 context switching
//!
//! Voluntary switches only save the System V callee-saved set; the
//! compiler has already spilled everything else around the call.

use std::arch::naked_asm;

/// Callee-saved register set for a suspended fiber
///
/// Field order is load-bearing: the assembly below addresses these by
/// fixed offset.
#[derive(Debug, Default)]
#[repr(C)]
pub struct SavedRegs {
    pub sp: u64,  // 0x00
    pub ip: u64,  // 0x08
    pub rbx: u64, // 0x10
    pub rbp: u64, // 0x18
    pub r12: u64, // 0x20
    pub r13: u64, // 0x28
    pub r14: u64, // 0x30
    pub r15: u64, // 0x38
}

/// Prepare a fresh context so the first switch into it enters
/// `entry_fn(entry_arg)` on the given stack.
///
/// # Safety
///
/// `regs` must point to valid `SavedRegs` memory and `stack_top` must be
/// the high end of a mapped stack region. `entry_fn` must never return
/// (it must switch away instead).
#[inline]
pub unsafe fn init_context(
    regs: *mut SavedRegs,
    stack_top: *mut u8,
    entry_fn: usize,
    entry_arg: usize,
) {
    // 16-byte aligned at the trampoline, so the trampoline's `call`
    // leaves the entry function on the standard System V alignment.
    let aligned_sp = (stack_top as usize) & !0xF;

    let regs = &mut *regs;
    regs.sp = aligned_sp as u64;
    regs.ip = fiber_trampoline as usize as u64;
    regs.rbx = 0;
    regs.rbp = 0;
    regs.r12 = entry_fn as u64;
    regs.r13 = entry_arg as u64;
    regs.r14 = 0;
    regs.r15 = 0;
}

/// First-switch entry: moves the stashed argument into place and calls
/// the entry function. The entry function performs the final switch out
/// itself, so control never comes back here.
#[unsafe(naked)]
unsafe extern "C" fn fiber_trampoline() {
    naked_asm!(
        "mov rdi, r13",
        "call r12",
        "ud2",
    );
}

/// Swap contexts: save callee-saved registers into `old_regs`, load from
/// `new_regs`, and continue wherever `new_regs` last suspended.
///
/// # Safety
///
/// `old_regs` must be the register area of the currently-executing
/// context and `new_regs` a context prepared by `init_context` or a
/// previous save. Both must stay valid for the lifetime of the switch.
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(_old_regs: *mut SavedRegs, _new_regs: *const SavedRegs) {
    naked_asm!(
        // Save callee-saved registers to old_regs (RDI)
        "mov [rdi + 0x00], rsp",
        "lea rax, [rip + 1f]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        // Load callee-saved registers from new_regs (RSI)
        "mov rsp, [rsi + 0x00]",
        "mov rax, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        // Jump to the saved resume point
        "jmp rax",
        // Resume point for the context saved above
        "1:",
        "ret",
    );
}
