//! Single-pass recursive-descent parser and code generator (spec §4.2):
//! turns a token stream straight into a `Proto`'s bytecode, with no
//! intermediate AST, mirroring the teacher's `LuaParser` (`compiler/parser/mod.rs`)
//! structure-wise (one `FuncState` per nested function, a block-scope stack,
//! precedence-climbing expressions) while targeting this crate's simplified
//! `ExpDesc`/opcode set instead of the teacher's 5.4/5.5-shaped one.
//!
//! Global variable access compiles through an `_ENV` upvalue exactly as in
//! reference Lua: the main chunk is seeded with `_ENV` as upvalue 0, and a
//! bare name that isn't a local or an enclosing upvalue resolves to
//! `_ENV.name` (`GETTABUP`/`SETTABUP`), threaded down through nested
//! functions by the same local/upvalue resolution used for any other name.
//!
//! Register temporaries are not packed as tightly as the teacher's
//! `freereg`/`exp2reg` dance: `block()` resets `freereg` to `nactvar` before
//! every statement, so a statement's scratch registers are simply abandoned
//! rather than individually freed. This trades a larger `max_stack_size` for
//! a much smaller set of cases to get right, and does not change any
//! observable Lua semantics.

use crate::error::{LuaError, LuaResult};
use crate::lexer::{Lexer, TokenKind};
use crate::value::closure::{Proto, UpvalDesc};
use crate::value::lua_value::LuaValue;
use crate::vm::instruction::Instruction as I;
use crate::vm::opcode::OpCode;
use std::rc::Rc;

use super::expdesc::ExpDesc;
use super::func_state::FuncState;

pub struct Parser<'a> {
    lexer: Lexer<'a>,
    funcs: Vec<FuncState>,
}

/// Compiles a chunk into its main `Proto`. The main chunk is itself a
/// vararg function whose only upvalue is `_ENV`, per spec §4.2's
/// `_ENV`-upvalue convention — the host closes it over the global table
/// when it builds the outermost `LuaClosure`.
pub fn parse(source: &str, chunk_name: &str) -> LuaResult<Rc<Proto>> {
    let mut p = Parser::new(source, chunk_name)?;
    let mut main = FuncState::new(chunk_name.to_string());
    main.proto.is_vararg = true;
    main.proto.upvalues.push(UpvalDesc { name: "_ENV".to_string(), in_stack: true, index: 0 });
    p.funcs.push(main);
    p.fs_mut().open_block(false);
    p.block()?;
    if !p.check(TokenKind::Eof) {
        return Err(p.syntax_err("'<eof>' expected"));
    }
    let line = p.line();
    p.fs_mut().close_block();
    let proto = p.finish_function(line)?;
    Ok(Rc::new(proto))
}

impl<'a> Parser<'a> {
    fn new(source: &'a str, chunk_name: &str) -> LuaResult<Self> {
        let lexer = Lexer::new(source, chunk_name.to_string())?;
        Ok(Parser { lexer, funcs: Vec::new() })
    }

    fn fs(&self) -> &FuncState {
        self.funcs.last().unwrap()
    }
    fn fs_mut(&mut self) -> &mut FuncState {
        self.funcs.last_mut().unwrap()
    }

    fn cur(&self) -> TokenKind {
        self.lexer.current.kind
    }
    fn line(&self) -> u32 {
        self.lexer.current.line
    }
    fn check(&self, kind: TokenKind) -> bool {
        self.cur() == kind
    }
    fn advance(&mut self) -> LuaResult<()> {
        self.lexer.next()
    }
    fn expect(&mut self, kind: TokenKind, what: &str) -> LuaResult<()> {
        if self.cur() != kind {
            return Err(self.syntax_err(&format!("{} expected", what)));
        }
        self.advance()
    }
    fn expect_name(&mut self) -> LuaResult<String> {
        if !self.check(TokenKind::Name) {
            return Err(self.syntax_err("<name> expected"));
        }
        let s = self.lexer.current.text.clone().unwrap();
        self.advance()?;
        Ok(s)
    }
    fn syntax_err(&self, msg: &str) -> LuaError {
        LuaError::syntax(&self.fs_source(), self.line(), msg)
    }
    fn fs_source(&self) -> String {
        self.funcs.last().map(|f| f.proto.source.clone()).unwrap_or_default()
    }

    fn block_follow(&self) -> bool {
        matches!(self.cur(), TokenKind::End | TokenKind::Else | TokenKind::Elseif | TokenKind::Until | TokenKind::Eof)
    }

    // --- blocks & statements --------------------------------------------

    fn block(&mut self) -> LuaResult<()> {
        while !self.block_follow() {
            if self.check(TokenKind::Return) {
                self.return_stat()?;
                break;
            }
            let nactvar = self.fs().nactvar();
            self.fs_mut().freereg = nactvar;
            self.statement()?;
        }
        Ok(())
    }

    fn statement(&mut self) -> LuaResult<()> {
        match self.cur() {
            TokenKind::Semi => self.advance(),
            TokenKind::If => self.if_stat(),
            TokenKind::While => self.while_stat(),
            TokenKind::Do => {
                self.advance()?;
                self.fs_mut().open_block(false);
                self.block()?;
                self.fs_mut().close_block();
                self.expect(TokenKind::End, "'end'")
            }
            TokenKind::For => self.for_stat(),
            TokenKind::Repeat => self.repeat_stat(),
            TokenKind::Function => self.function_stat(),
            TokenKind::Local => self.local_stat(),
            TokenKind::Break => self.break_stat(),
            TokenKind::Goto => self.goto_stat(),
            TokenKind::DbColon => self.label_stat(),
            _ => self.expr_stat(),
        }
    }

    fn if_stat(&mut self) -> LuaResult<()> {
        self.advance()?; // 'if'
        let mut end_jumps = Vec::new();
        self.if_clause(&mut end_jumps)?;
        while self.check(TokenKind::Elseif) {
            self.advance()?;
            self.if_clause(&mut end_jumps)?;
        }
        if self.check(TokenKind::Else) {
            self.advance()?;
            self.fs_mut().open_block(false);
            self.block()?;
            self.fs_mut().close_block();
        }
        self.expect(TokenKind::End, "'end'")?;
        for j in end_jumps {
            self.fs_mut().patch_jump_here(j);
        }
        Ok(())
    }

    /// Consumes `cond 'then' block`; `if`/`elseif` was already consumed.
    fn if_clause(&mut self, end_jumps: &mut Vec<usize>) -> LuaResult<()> {
        let cond = self.parse_expr()?;
        let line = self.line();
        self.expect(TokenKind::Then, "'then'")?;
        let reg = self.discharge_any(cond, line);
        let false_jump = self.jump_if_false(reg, line);
        self.fs_mut().open_block(false);
        self.block()?;
        self.fs_mut().close_block();
        if matches!(self.cur(), TokenKind::Elseif | TokenKind::Else) {
            let line = self.line();
            let j = self.fs_mut().emit_jump(line);
            end_jumps.push(j);
        }
        self.fs_mut().patch_jump_here(false_jump);
        Ok(())
    }

    fn while_stat(&mut self) -> LuaResult<()> {
        self.advance()?; // 'while'
        let loop_start = self.fs().current_pc();
        let cond = self.parse_expr()?;
        let line = self.line();
        self.expect(TokenKind::Do, "'do'")?;
        let reg = self.discharge_any(cond, line);
        let exit_jump = self.jump_if_false(reg, line);
        self.fs_mut().open_block(true);
        self.block()?;
        let blk = self.fs_mut().close_block();
        let line = self.line();
        let back = self.fs_mut().emit_jump(line);
        self.fs_mut().patch_jump_to(back, loop_start);
        self.fs_mut().patch_jump_here(exit_jump);
        for j in blk.break_jumps {
            self.fs_mut().patch_jump_here(j);
        }
        self.expect(TokenKind::End, "'end'")
    }

    fn repeat_stat(&mut self) -> LuaResult<()> {
        self.advance()?; // 'repeat'
        let loop_start = self.fs().current_pc();
        self.fs_mut().open_block(true);
        self.block()?;
        self.expect(TokenKind::Until, "'until'")?;
        // The until-condition can see locals declared in the loop body, so
        // it's parsed before the block's scope closes.
        let cond = self.parse_expr()?;
        let line = self.line();
        let reg = self.discharge_any(cond, line);
        let blk = self.fs_mut().close_block();
        self.fs_mut().emit_abc(OpCode::Test, reg as u32, 0, 0, line);
        let back = self.fs_mut().emit_jump(line);
        self.fs_mut().patch_jump_to(back, loop_start);
        for j in blk.break_jumps {
            self.fs_mut().patch_jump_here(j);
        }
        Ok(())
    }

    fn for_stat(&mut self) -> LuaResult<()> {
        let line0 = self.line();
        self.advance()?; // 'for'
        let name = self.expect_name()?;
        if self.check(TokenKind::Assign) {
            self.numeric_for(name, line0)
        } else {
            self.generic_for(name, line0)
        }
    }

    fn numeric_for(&mut self, name: String, line0: u32) -> LuaResult<()> {
        self.advance()?; // '='
        let init = self.parse_expr()?;
        self.expect(TokenKind::Comma, "','")?;
        let limit = self.parse_expr()?;
        let step = if self.check(TokenKind::Comma) {
            self.advance()?;
            Some(self.parse_expr()?)
        } else {
            None
        };
        self.expect(TokenKind::Do, "'do'")?;

        self.fs_mut().open_block(true);
        let base = self.fs_mut().reserve_regs(4);
        self.discharge_to_reg(init, base, line0);
        self.discharge_to_reg(limit, base + 1, line0);
        match step {
            Some(s) => self.discharge_to_reg(s, base + 2, line0),
            None => self.discharge_to_reg(ExpDesc::Const(LuaValue::Int(1)), base + 2, line0),
        }
        self.fs_mut().bind_local_at(name, base + 3);

        let prep_pc = self.fs_mut().emit_asbx(OpCode::ForPrep, base as u32, 0, line0);
        let body_start = self.fs().current_pc();
        self.block()?;
        let blk = self.fs_mut().close_block();
        self.expect(TokenKind::End, "'end'")?;
        let loop_pc = self.fs().current_pc();
        self.fs_mut().patch_jump_to(prep_pc, loop_pc);
        self.fs_mut().emit_asbx(OpCode::ForLoop, base as u32, 0, line0);
        self.fs_mut().patch_jump_to(loop_pc, body_start);
        for j in blk.break_jumps {
            self.fs_mut().patch_jump_here(j);
        }
        Ok(())
    }

    fn generic_for(&mut self, first_name: String, line0: u32) -> LuaResult<()> {
        let mut names = vec![first_name];
        while self.check(TokenKind::Comma) {
            self.advance()?;
            names.push(self.expect_name()?);
        }
        self.expect(TokenKind::In, "'in'")?;
        let ctrl_base = self.fs().freereg;
        let (n, last, line) = self.parse_expr_list()?;
        if n == 0 {
            self.force_n_results(last, ctrl_base, 3, line);
        } else {
            self.discharge_to_next_reg(last, line);
            let have = n + 1;
            if have < 3 {
                for _ in have..3 {
                    self.discharge_to_next_reg(ExpDesc::Nil, line);
                }
            } else {
                self.fs_mut().freereg = ctrl_base + 3;
            }
        }
        self.expect(TokenKind::Do, "'do'")?;

        self.fs_mut().open_block(true);
        let nvars = names.len() as u8;
        let vars_base = self.fs_mut().reserve_regs(nvars);
        for (i, name) in names.into_iter().enumerate() {
            self.fs_mut().bind_local_at(name, vars_base + i as u8);
        }
        let skip_jump = self.fs_mut().emit_jump(line0);
        let body_start = self.fs().current_pc();
        self.block()?;
        self.fs_mut().patch_jump_here(skip_jump);
        self.fs_mut().emit_abc(OpCode::TForCall, ctrl_base as u32, 0, nvars as u32, line0);
        let tforloop_pc = self.fs_mut().emit_asbx(OpCode::TForLoop, ctrl_base as u32, 0, line0);
        self.fs_mut().patch_jump_to(tforloop_pc, body_start);
        let blk = self.fs_mut().close_block();
        self.expect(TokenKind::End, "'end'")?;
        for j in blk.break_jumps {
            self.fs_mut().patch_jump_here(j);
        }
        Ok(())
    }

    fn function_stat(&mut self) -> LuaResult<()> {
        let line0 = self.line();
        self.advance()?; // 'function'
        let first = self.expect_name()?;
        let mut target = self.resolve_name(&first);
        let mut is_method = false;
        loop {
            match self.cur() {
                TokenKind::Dot => {
                    self.advance()?;
                    let name = self.expect_name()?;
                    target = ExpDesc::Indexed { table: Box::new(target), key: Box::new(ExpDesc::Const(LuaValue::string(name))) };
                }
                TokenKind::Colon => {
                    self.advance()?;
                    let name = self.expect_name()?;
                    target = ExpDesc::Indexed { table: Box::new(target), key: Box::new(ExpDesc::Const(LuaValue::string(name))) };
                    is_method = true;
                    break;
                }
                _ => break,
            }
        }
        let closure = self.function_body(is_method, line0)?;
        let line = self.line();
        self.assign_to(target, closure, line);
        Ok(())
    }

    fn local_stat(&mut self) -> LuaResult<()> {
        self.advance()?; // 'local'
        if self.check(TokenKind::Function) {
            self.advance()?;
            let name = self.expect_name()?;
            // Declared before the body is parsed, so the function can call
            // itself recursively through the local (the closure's upvalue
            // stays open and re-reads this register at call time).
            let reg = self.fs_mut().new_local(name);
            let line = self.line();
            let closure = self.function_body(false, line)?;
            self.discharge_to_reg(closure, reg, line);
            return Ok(());
        }
        let mut names = vec![self.expect_name()?];
        while self.check(TokenKind::Comma) {
            self.advance()?;
            names.push(self.expect_name()?);
        }
        let nvars = names.len() as u32;
        if self.check(TokenKind::Assign) {
            self.advance()?;
            let (n, last, line) = self.parse_expr_list()?;
            let have = n + 1;
            self.discharge_to_next_reg(last, line);
            if have < nvars {
                for _ in have..nvars {
                    self.discharge_to_next_reg(ExpDesc::Nil, line);
                }
            }
        } else {
            let line = self.line();
            for _ in 0..nvars {
                self.discharge_to_next_reg(ExpDesc::Nil, line);
            }
        }
        let start = self.fs().nactvar();
        for (i, name) in names.into_iter().enumerate() {
            self.fs_mut().bind_local_at(name, start + i as u8);
        }
        Ok(())
    }

    fn break_stat(&mut self) -> LuaResult<()> {
        let line = self.line();
        self.advance()?;
        let jmp = self.fs_mut().emit_jump(line);
        match self.fs_mut().blocks.iter_mut().rev().find(|b| b.is_loop) {
            Some(b) => {
                b.break_jumps.push(jmp);
                Ok(())
            }
            None => Err(self.syntax_err("break outside a loop")),
        }
    }

    fn goto_stat(&mut self) -> LuaResult<()> {
        let line = self.line();
        self.advance()?;
        let name = self.expect_name()?;
        let nactvar = self.fs().nactvar();
        if let Some((target, label_nactvar)) =
            self.fs().labels.iter().find(|l| l.name == name).map(|l| (l.pc, l.nactvar))
        {
            if nactvar < label_nactvar {
                let local = self.fs().local_name_at(nactvar).unwrap_or("?").to_string();
                return Err(LuaError::syntax(
                    &self.fs().proto.source,
                    line,
                    format!("<goto {name}> at line {line} jumps into the scope of local '{local}'"),
                ));
            }
            let jmp = self.fs_mut().emit_jump(line);
            self.fs_mut().patch_jump_to(jmp, target);
        } else {
            let jmp = self.fs_mut().emit_jump(line);
            self.fs_mut().pending_gotos.push(super::func_state::PendingGoto { name, pc: jmp, nactvar, line });
        }
        Ok(())
    }

    fn label_stat(&mut self) -> LuaResult<()> {
        self.advance()?; // '::'
        let name = self.expect_name()?;
        self.expect(TokenKind::DbColon, "'::'")?;
        let pc = self.fs().current_pc();
        let nactvar = self.fs().nactvar();
        self.fs_mut().labels.push(super::func_state::Label { name: name.clone(), pc, nactvar });
        let (matching, rest): (Vec<_>, Vec<_>) = self.fs_mut().pending_gotos.drain(..).partition(|g| g.name == name);
        for g in matching {
            if g.nactvar < nactvar {
                let local = self.fs().local_name_at(g.nactvar).unwrap_or("?").to_string();
                return Err(LuaError::syntax(
                    &self.fs().proto.source,
                    g.line,
                    format!("<goto {}> at line {} jumps into the scope of local '{local}'", g.name, g.line),
                ));
            }
            self.fs_mut().patch_jump_to(g.pc, pc);
        }
        self.fs_mut().pending_gotos = rest;
        Ok(())
    }

    fn return_stat(&mut self) -> LuaResult<()> {
        let line = self.line();
        self.advance()?; // 'return'
        if self.block_follow() || self.check(TokenKind::Semi) {
            self.fs_mut().emit_abc(OpCode::Return, 0, 1, 0, line);
        } else {
            let base = self.fs().freereg;
            let (n, last, vline) = self.parse_expr_list()?;
            if last.is_multret() {
                self.open_multret(last, vline);
                self.fs_mut().emit_abc(OpCode::Return, base as u32, 0, 0, vline);
            } else {
                self.discharge_to_next_reg(last, vline);
                self.fs_mut().emit_abc(OpCode::Return, base as u32, n + 2, 0, vline);
            }
        }
        if self.check(TokenKind::Semi) {
            self.advance()?;
        }
        Ok(())
    }

    fn expr_stat(&mut self) -> LuaResult<()> {
        let first = self.suffixed_exp()?;
        if !self.check(TokenKind::Assign) && !self.check(TokenKind::Comma) {
            if !matches!(first, ExpDesc::Call { .. }) {
                return Err(self.syntax_err("syntax error (statement has no effect)"));
            }
            return Ok(());
        }
        let mut targets = vec![first];
        while self.check(TokenKind::Comma) {
            self.advance()?;
            targets.push(self.suffixed_exp()?);
        }
        for t in &targets {
            if matches!(t, ExpDesc::Call { .. }) {
                return Err(self.syntax_err("syntax error near '='"));
            }
        }
        self.expect(TokenKind::Assign, "'='")?;
        let snapshot = self.fs().freereg;
        let (n, last, line) = self.parse_expr_list()?;
        let nvals = targets.len() as u32;
        let have = n + 1;
        self.discharge_to_next_reg(last, line);
        if have < nvals {
            for _ in have..nvals {
                self.discharge_to_next_reg(ExpDesc::Nil, line);
            }
        }
        for (i, target) in targets.into_iter().enumerate() {
            let vreg = snapshot + i as u8;
            self.assign_to(target, ExpDesc::Reg(vreg), line);
        }
        Ok(())
    }

    fn assign_to(&mut self, target: ExpDesc, value: ExpDesc, line: u32) {
        match target {
            ExpDesc::Reg(r) => self.discharge_to_reg(value, r, line),
            ExpDesc::Upval(u) => {
                let r = self.discharge_any(value, line);
                self.fs_mut().emit_abc(OpCode::SetUpval, r as u32, u as u32, 0, line);
                self.fs_mut().free_reg(r);
            }
            ExpDesc::Global(name) => {
                let env = self.resolve_env_upvalue();
                let k = self.const_rk(LuaValue::string(name), line);
                let v = self.expr_to_rk(value, line);
                self.fs_mut().emit_abc(OpCode::SetTabUp, env as u32, k, v, line);
                self.free_rk(v);
                self.free_rk(k);
            }
            ExpDesc::Indexed { table, key } => {
                let t = self.discharge_any(*table, line);
                let k = self.expr_to_rk(*key, line);
                let v = self.expr_to_rk(value, line);
                self.fs_mut().emit_abc(OpCode::SetTable, t as u32, k, v, line);
                self.free_rk(v);
                self.free_rk(k);
                self.fs_mut().free_reg(t);
            }
            _ => unreachable!("not an assignable expression"),
        }
    }

    fn function_body(&mut self, is_method: bool, line0: u32) -> LuaResult<ExpDesc> {
        self.expect(TokenKind::LParen, "'('")?;
        let source = self.fs().proto.source.clone();
        let mut fs = FuncState::new(source);
        fs.proto.line_defined = line0;
        self.funcs.push(fs);
        if is_method {
            self.fs_mut().new_local("self".to_string());
        }
        if !self.check(TokenKind::RParen) {
            loop {
                if self.check(TokenKind::Ellipsis) {
                    self.advance()?;
                    self.fs_mut().proto.is_vararg = true;
                    break;
                }
                let name = self.expect_name()?;
                self.fs_mut().new_local(name);
                if self.check(TokenKind::Comma) {
                    self.advance()?;
                } else {
                    break;
                }
            }
        }
        self.expect(TokenKind::RParen, "')'")?;
        let nparams = self.fs().nactvar();
        self.fs_mut().proto.num_params = nparams;
        self.fs_mut().open_block(false);
        self.block()?;
        self.fs_mut().close_block();
        let end_line = self.line();
        self.expect(TokenKind::End, "'end'")?;
        let child = self.finish_function(end_line)?;
        let parent = self.funcs.last_mut().unwrap();
        let proto_idx = parent.proto.protos.len() as u32;
        parent.proto.protos.push(Rc::new(child));
        let dest = parent.reserve_regs(1);
        parent.emit_abx(OpCode::Closure, dest as u32, proto_idx, end_line);
        Ok(ExpDesc::Reg(dest))
    }

    fn finish_function(&mut self, ret_line: u32) -> LuaResult<Proto> {
        let mut fs = self.funcs.pop().unwrap();
        if let Some(g) = fs.pending_gotos.first() {
            return Err(LuaError::syntax(&fs.proto.source, g.line, format!("no visible label '{}' for goto", g.name)));
        }
        fs.emit_abc(OpCode::Return, 0, 1, 0, ret_line);
        Ok(fs.proto)
    }

    // --- name resolution (locals / upvalues / `_ENV`-chained globals) --

    fn resolve_name(&mut self, name: &str) -> ExpDesc {
        let level = self.funcs.len() - 1;
        self.resolve_at(level, name)
    }

    fn resolve_at(&mut self, level: usize, name: &str) -> ExpDesc {
        if let Some(r) = self.funcs[level].resolve_local(name) {
            return ExpDesc::Reg(r);
        }
        if let Some(u) = self.funcs[level].resolve_upvalue(name) {
            return ExpDesc::Upval(u);
        }
        if level == 0 {
            return ExpDesc::Global(name.to_string());
        }
        match self.resolve_at(level - 1, name) {
            ExpDesc::Reg(r) => {
                let idx = self.funcs[level].add_upvalue(name.to_string(), true, r as u32);
                ExpDesc::Upval(idx)
            }
            ExpDesc::Upval(u) => {
                let idx = self.funcs[level].add_upvalue(name.to_string(), false, u as u32);
                ExpDesc::Upval(idx)
            }
            g @ ExpDesc::Global(_) => g,
            _ => unreachable!(),
        }
    }

    fn resolve_env_upvalue(&mut self) -> u8 {
        let level = self.funcs.len() - 1;
        match self.resolve_at(level, "_ENV") {
            ExpDesc::Upval(u) => u,
            _ => unreachable!("_ENV always resolves to an upvalue"),
        }
    }

    // --- expression parsing (precedence climbing) -----------------------

    fn parse_expr(&mut self) -> LuaResult<ExpDesc> {
        self.subexpr(0)
    }

    const UNARY_PRIORITY: u8 = 12;

    fn subexpr(&mut self, limit: u8) -> LuaResult<ExpDesc> {
        let mut e = if let Some(op) = unary_op(self.cur()) {
            let line = self.line();
            self.advance()?;
            let operand = self.subexpr(Self::UNARY_PRIORITY)?;
            self.apply_unary(op, operand, line)
        } else {
            self.simple_exp()?
        };
        while let Some((lp, rp)) = bin_priority(self.cur()) {
            if lp <= limit {
                break;
            }
            let op = self.cur();
            let line = self.line();
            self.advance()?;
            let rhs = self.subexpr(rp)?;
            e = self.apply_binop(op, e, rhs, line);
        }
        Ok(e)
    }

    fn simple_exp(&mut self) -> LuaResult<ExpDesc> {
        match self.cur() {
            TokenKind::Nil => {
                self.advance()?;
                Ok(ExpDesc::Nil)
            }
            TokenKind::True => {
                self.advance()?;
                Ok(ExpDesc::True)
            }
            TokenKind::False => {
                self.advance()?;
                Ok(ExpDesc::False)
            }
            TokenKind::Int => {
                let v = self.lexer.current.ival;
                self.advance()?;
                Ok(ExpDesc::Const(LuaValue::Int(v)))
            }
            TokenKind::Float => {
                let v = self.lexer.current.fval;
                self.advance()?;
                Ok(ExpDesc::Const(LuaValue::Float(v)))
            }
            TokenKind::String => {
                let s = self.lexer.current.sval.clone().unwrap();
                self.advance()?;
                Ok(ExpDesc::Const(LuaValue::string_bytes(s)))
            }
            TokenKind::Ellipsis => {
                self.advance()?;
                if !self.fs().proto.is_vararg {
                    return Err(self.syntax_err("cannot use '...' outside a vararg function"));
                }
                Ok(ExpDesc::Vararg)
            }
            TokenKind::LBrace => self.table_constructor(),
            TokenKind::Function => {
                let line = self.line();
                self.advance()?;
                self.function_body(false, line)
            }
            _ => self.suffixed_exp(),
        }
    }

    fn primary_exp(&mut self) -> LuaResult<ExpDesc> {
        match self.cur() {
            TokenKind::LParen => {
                self.advance()?;
                let e = self.parse_expr()?;
                self.expect(TokenKind::RParen, "')'")?;
                Ok(self.truncate_to_single(e))
            }
            TokenKind::Name => {
                let name = self.expect_name()?;
                Ok(self.resolve_name(&name))
            }
            _ => Err(self.syntax_err("unexpected symbol")),
        }
    }

    fn truncate_to_single(&mut self, e: ExpDesc) -> ExpDesc {
        if e.is_multret() {
            let line = self.line();
            ExpDesc::Reg(self.discharge_to_next_reg(e, line))
        } else {
            e
        }
    }

    fn suffixed_exp(&mut self) -> LuaResult<ExpDesc> {
        let mut e = self.primary_exp()?;
        loop {
            match self.cur() {
                TokenKind::Dot => {
                    self.advance()?;
                    let name = self.expect_name()?;
                    e = ExpDesc::Indexed { table: Box::new(e), key: Box::new(ExpDesc::Const(LuaValue::string(name))) };
                }
                TokenKind::LBracket => {
                    self.advance()?;
                    let k = self.parse_expr()?;
                    self.expect(TokenKind::RBracket, "']'")?;
                    e = ExpDesc::Indexed { table: Box::new(e), key: Box::new(k) };
                }
                TokenKind::Colon => {
                    self.advance()?;
                    let method = self.expect_name()?;
                    let line = self.line();
                    let tbl_reg = self.discharge_any(e, line);
                    self.fs_mut().free_reg(tbl_reg);
                    let call_base = self.fs_mut().reserve_regs(2);
                    let key_rk = self.const_rk(LuaValue::string(method), line);
                    self.fs_mut().emit_abc(OpCode::SelfOp, call_base as u32, tbl_reg as u32, key_rk, line);
                    let (nargs, open) = self.parse_call_args(line)?;
                    e = self.finish_call(call_base, nargs + 1, open, line);
                }
                TokenKind::LParen | TokenKind::String | TokenKind::LBrace => {
                    let line = self.line();
                    let call_base = self.discharge_to_next_reg(e, line);
                    let (nargs, open) = self.parse_call_args(line)?;
                    e = self.finish_call(call_base, nargs, open, line);
                }
                _ => break,
            }
        }
        Ok(e)
    }

    fn parse_call_args(&mut self, line: u32) -> LuaResult<(u32, bool)> {
        match self.cur() {
            TokenKind::LParen => {
                self.advance()?;
                if self.check(TokenKind::RParen) {
                    self.advance()?;
                    return Ok((0, false));
                }
                let (n, last, vline) = self.parse_expr_list()?;
                self.expect(TokenKind::RParen, "')'")?;
                if last.is_multret() {
                    self.open_multret(last, vline);
                    Ok((n, true))
                } else {
                    self.discharge_to_next_reg(last, vline);
                    Ok((n + 1, false))
                }
            }
            TokenKind::String => {
                let s = self.lexer.current.sval.clone().unwrap();
                self.advance()?;
                self.discharge_to_next_reg(ExpDesc::Const(LuaValue::string_bytes(s)), line);
                Ok((1, false))
            }
            TokenKind::LBrace => {
                let e = self.table_constructor()?;
                self.discharge_to_next_reg(e, line);
                Ok((1, false))
            }
            _ => Err(self.syntax_err("function arguments expected")),
        }
    }

    fn finish_call(&mut self, call_base: u8, nfixed: u32, last_open: bool, line: u32) -> ExpDesc {
        let b = if last_open { 0 } else { nfixed + 1 };
        let pc = self.fs_mut().emit_abc(OpCode::Call, call_base as u32, b, 2, line);
        self.fs_mut().freereg = call_base + 1;
        ExpDesc::Call { base: call_base, pc, open: false }
    }

    /// Parses a comma-separated expression list, discharging every element
    /// but the last into sequential fresh registers (mirrors reference
    /// Lua's `explist`: only the caller knows whether the final element
    /// should be truncated to one value or left open for multret).
    fn parse_expr_list(&mut self) -> LuaResult<(u32, ExpDesc, u32)> {
        let mut n = 0u32;
        let mut line = self.line();
        let mut last = self.parse_expr()?;
        while self.check(TokenKind::Comma) {
            self.advance()?;
            self.discharge_to_next_reg(last, line);
            n += 1;
            line = self.line();
            last = self.parse_expr()?;
        }
        Ok((n, last, line))
    }

    fn table_constructor(&mut self) -> LuaResult<ExpDesc> {
        let line = self.line();
        self.expect(TokenKind::LBrace, "'{'")?;
        let table_reg = self.fs_mut().reserve_regs(1);
        self.fs_mut().emit_abc(OpCode::NewTable, table_reg as u32, 0, 0, line);
        let mut has_positional = false;
        loop {
            if self.check(TokenKind::RBrace) {
                break;
            }
            if self.check(TokenKind::LBracket) {
                self.advance()?;
                let key = self.parse_expr()?;
                self.expect(TokenKind::RBracket, "']'")?;
                self.expect(TokenKind::Assign, "'='")?;
                let val = self.parse_expr()?;
                let vline = self.line();
                let kk = self.expr_to_rk(key, vline);
                let vv = self.expr_to_rk(val, vline);
                self.fs_mut().emit_abc(OpCode::SetTable, table_reg as u32, kk, vv, vline);
                self.free_rk(vv);
                self.free_rk(kk);
            } else if self.check(TokenKind::Name) && self.lexer.lookahead()?.kind == TokenKind::Assign {
                let name = self.expect_name()?;
                self.advance()?; // '='
                let val = self.parse_expr()?;
                let vline = self.line();
                let kk = self.const_rk(LuaValue::string(name), vline);
                let vv = self.expr_to_rk(val, vline);
                self.fs_mut().emit_abc(OpCode::SetTable, table_reg as u32, kk, vv, vline);
                self.free_rk(vv);
                self.free_rk(kk);
            } else {
                has_positional = true;
                let e = self.parse_expr()?;
                let vline = self.line();
                let is_last = !self.check(TokenKind::Comma) && !self.check(TokenKind::Semi);
                if is_last && e.is_multret() {
                    self.open_multret(e, vline);
                } else {
                    self.discharge_to_next_reg(e, vline);
                }
            }
            if self.check(TokenKind::Comma) || self.check(TokenKind::Semi) {
                self.advance()?;
            } else {
                break;
            }
        }
        self.expect(TokenKind::RBrace, "'}'")?;
        if has_positional {
            self.fs_mut().emit_abc(OpCode::SetList, table_reg as u32, 0, 0, line);
            self.fs_mut().emit(I::create_ax(OpCode::ExtraArg, 1), line);
        }
        self.fs_mut().freereg = table_reg + 1;
        Ok(ExpDesc::Reg(table_reg))
    }

    // --- discharging expressions into registers / RK operands -----------

    fn discharge_to_reg(&mut self, e: ExpDesc, dest: u8, line: u32) {
        match e {
            ExpDesc::Nil => {
                self.fs_mut().emit_abc(OpCode::LoadNil, dest as u32, 0, 0, line);
            }
            ExpDesc::True => {
                self.fs_mut().emit_abc(OpCode::LoadBool, dest as u32, 1, 0, line);
            }
            ExpDesc::False => {
                self.fs_mut().emit_abc(OpCode::LoadBool, dest as u32, 0, 0, line);
            }
            ExpDesc::Const(v) => {
                let k = self.fs_mut().add_constant(v);
                self.fs_mut().emit_abx(OpCode::LoadK, dest as u32, k, line);
            }
            ExpDesc::Reg(r) => {
                if r != dest {
                    self.fs_mut().emit_abc(OpCode::Move, dest as u32, r as u32, 0, line);
                }
            }
            ExpDesc::Upval(u) => {
                self.fs_mut().emit_abc(OpCode::GetUpval, dest as u32, u as u32, 0, line);
            }
            ExpDesc::Global(name) => {
                let env = self.resolve_env_upvalue();
                let k = self.const_rk(LuaValue::string(name), line);
                self.fs_mut().emit_abc(OpCode::GetTabUp, dest as u32, env as u32, k, line);
                self.free_rk(k);
            }
            ExpDesc::Indexed { table, key } => {
                let t = self.discharge_any(*table, line);
                let k = self.expr_to_rk(*key, line);
                self.fs_mut().emit_abc(OpCode::GetTable, dest as u32, t as u32, k, line);
                self.free_rk(k);
                self.fs_mut().free_reg(t);
            }
            ExpDesc::Call { base, .. } => {
                if base != dest {
                    self.fs_mut().emit_abc(OpCode::Move, dest as u32, base as u32, 0, line);
                }
            }
            ExpDesc::Vararg => {
                self.fs_mut().emit_abc(OpCode::Vararg, dest as u32, 2, 0, line);
            }
        }
    }

    /// Fetches a register holding `e`'s value, reusing an existing register
    /// as-is for `Reg`/`Call` rather than moving it anywhere — correct
    /// whenever the caller only needs *a* register (an operand slot) and
    /// will free it itself once done, not a specific stack position.
    fn discharge_any(&mut self, e: ExpDesc, line: u32) -> u8 {
        match e {
            ExpDesc::Reg(r) => r,
            ExpDesc::Call { base, .. } => base,
            other => self.eval_fresh(other, line),
        }
    }

    /// Like [`discharge_any`] but always lands in a *new* top-of-stack
    /// register, even if `e` is already a register — required wherever
    /// later code depends on contiguous placement (call args, return
    /// values, table-constructor elements, assignment RHS). An existing
    /// temporary is freed before the new register is reserved, so the
    /// common case (the value is already topmost) reuses it in place
    /// instead of emitting a redundant `MOVE`.
    fn discharge_to_next_reg(&mut self, e: ExpDesc, line: u32) -> u8 {
        match e {
            ExpDesc::Reg(r) => {
                self.fs_mut().free_reg(r);
                let dest = self.fs_mut().reserve_regs(1);
                if dest != r {
                    self.fs_mut().emit_abc(OpCode::Move, dest as u32, r as u32, 0, line);
                }
                dest
            }
            ExpDesc::Call { base, .. } => {
                self.fs_mut().free_reg(base);
                let dest = self.fs_mut().reserve_regs(1);
                if dest != base {
                    self.fs_mut().emit_abc(OpCode::Move, dest as u32, base as u32, 0, line);
                }
                dest
            }
            other => self.eval_fresh(other, line),
        }
    }

    /// Evaluates an `Indexed`/`Global`/literal expression into a brand-new,
    /// fully self-contained register: any operand temporaries it needed
    /// along the way (the table, the key) are freed, in reverse allocation
    /// order, before the result register itself is reserved, so nothing is
    /// left allocated below the returned register. Reserving the result
    /// register only *after* sub-expressions are evaluated and freed (never
    /// before) is what keeps this stack-ordered, unlike naively discharging
    /// into a register reserved up front.
    fn eval_fresh(&mut self, e: ExpDesc, line: u32) -> u8 {
        match e {
            ExpDesc::Indexed { table, key } => {
                let t = self.discharge_any(*table, line);
                let k = self.expr_to_rk(*key, line);
                self.free_rk(k);
                self.fs_mut().free_reg(t);
                let dest = self.fs_mut().reserve_regs(1);
                self.fs_mut().emit_abc(OpCode::GetTable, dest as u32, t as u32, k, line);
                dest
            }
            ExpDesc::Global(name) => {
                let env = self.resolve_env_upvalue();
                let k = self.const_rk(LuaValue::string(name), line);
                self.free_rk(k);
                let dest = self.fs_mut().reserve_regs(1);
                self.fs_mut().emit_abc(OpCode::GetTabUp, dest as u32, env as u32, k, line);
                dest
            }
            other => {
                let dest = self.fs_mut().reserve_regs(1);
                self.discharge_to_reg(other, dest, line);
                dest
            }
        }
    }

    fn expr_to_rk(&mut self, e: ExpDesc, line: u32) -> u32 {
        match e {
            ExpDesc::Const(v) => self.const_rk(v, line),
            ExpDesc::Nil => self.const_rk(LuaValue::Nil, line),
            ExpDesc::True => self.const_rk(LuaValue::Bool(true), line),
            ExpDesc::False => self.const_rk(LuaValue::Bool(false), line),
            ExpDesc::Reg(r) => r as u32,
            other => self.discharge_any(other, line) as u32,
        }
    }

    fn const_rk(&mut self, v: LuaValue, line: u32) -> u32 {
        let k = self.fs_mut().add_constant(v);
        if k <= I::MAXINDEXRK {
            I::rk_const(k)
        } else {
            let r = self.fs_mut().reserve_regs(1);
            self.fs_mut().emit_abx(OpCode::LoadK, r as u32, k, line);
            r as u32
        }
    }

    /// Frees an RK operand's register if it was one (a plain register
    /// index, not a constant-pool reference) — a no-op for constants and
    /// for registers that aren't currently the topmost temporary.
    fn free_rk(&mut self, rk: u32) {
        if !I::is_k(rk) {
            self.fs_mut().free_reg(rk as u8);
        }
    }

    /// Re-opens an already-discharged `Call`/`Vararg` so it yields all of
    /// its results rather than a single truncated value (the `B=0`/`C=0`
    /// multret convention), used for the last element of an expression list
    /// in a multret-capable position (call args, `return`, table fields).
    fn open_multret(&mut self, e: ExpDesc, line: u32) {
        match e {
            ExpDesc::Call { base, pc, .. } => {
                self.fs_mut().patch_call_c(pc, 0);
                self.fs_mut().freereg = base + 1;
            }
            ExpDesc::Vararg => {
                let r = self.fs().freereg;
                self.fs_mut().emit_abc(OpCode::Vararg, r as u32, 0, 0, line);
            }
            other => {
                self.discharge_to_next_reg(other, line);
            }
        }
    }

    /// Forces a `Call`/`Vararg`/plain value to land exactly `n` results
    /// starting at `base` (used by generic `for`'s three control values).
    fn force_n_results(&mut self, e: ExpDesc, base: u8, n: u8, line: u32) {
        match e {
            ExpDesc::Call { pc, .. } => {
                self.fs_mut().patch_call_c(pc, n as u32 + 1);
                self.fs_mut().freereg = base + n;
            }
            ExpDesc::Vararg => {
                self.fs_mut().emit_abc(OpCode::Vararg, base as u32, n as u32 + 1, 0, line);
                self.fs_mut().freereg = base + n;
            }
            other => {
                self.discharge_to_reg(other, base, line);
                for i in 1..n {
                    self.discharge_to_reg(ExpDesc::Nil, base + i, line);
                }
                self.fs_mut().freereg = base + n;
            }
        }
    }

    // --- conditionals: materialize to a register, then TEST+JMP ---------

    fn jump_if_false(&mut self, reg: u8, line: u32) -> usize {
        self.fs_mut().emit_abc(OpCode::Test, reg as u32, 0, 0, line);
        self.fs_mut().emit_jump(line)
    }

    fn jump_if_true(&mut self, reg: u8, line: u32) -> usize {
        self.fs_mut().emit_abc(OpCode::Test, reg as u32, 0, 1, line);
        self.fs_mut().emit_jump(line)
    }

    // --- operators --------------------------------------------------------

    fn apply_unary(&mut self, op: TokenKind, operand: ExpDesc, line: u32) -> ExpDesc {
        let opcode = match op {
            TokenKind::Minus => OpCode::Unm,
            TokenKind::Not => OpCode::Not,
            TokenKind::Hash => OpCode::Len,
            TokenKind::Tilde => OpCode::BNot,
            _ => unreachable!(),
        };
        let r = self.discharge_any(operand, line);
        self.fs_mut().free_reg(r);
        let dest = self.fs_mut().reserve_regs(1);
        self.fs_mut().emit_abc(opcode, dest as u32, r as u32, 0, line);
        ExpDesc::Reg(dest)
    }

    fn apply_binop(&mut self, op: TokenKind, l: ExpDesc, r: ExpDesc, line: u32) -> ExpDesc {
        use TokenKind::*;
        match op {
            And => self.apply_and(l, r, line),
            Or => self.apply_or(l, r, line),
            Eq => self.apply_relational(OpCode::Eq, true, l, r, line),
            Ne => self.apply_relational(OpCode::Eq, false, l, r, line),
            Lt => self.apply_relational(OpCode::Lt, true, l, r, line),
            Gt => self.apply_relational(OpCode::Lt, true, r, l, line),
            Le => self.apply_relational(OpCode::Le, true, l, r, line),
            Ge => self.apply_relational(OpCode::Le, true, r, l, line),
            Concat => self.apply_concat(l, r, line),
            Plus => self.apply_arith(OpCode::Add, l, r, line),
            Minus => self.apply_arith(OpCode::Sub, l, r, line),
            Star => self.apply_arith(OpCode::Mul, l, r, line),
            Slash => self.apply_arith(OpCode::Div, l, r, line),
            IDiv => self.apply_arith(OpCode::IDiv, l, r, line),
            Percent => self.apply_arith(OpCode::Mod, l, r, line),
            Caret => self.apply_arith(OpCode::Pow, l, r, line),
            Amp => self.apply_arith(OpCode::BAnd, l, r, line),
            Pipe => self.apply_arith(OpCode::BOr, l, r, line),
            Tilde => self.apply_arith(OpCode::BXor, l, r, line),
            Shl => self.apply_arith(OpCode::Shl, l, r, line),
            Shr => self.apply_arith(OpCode::Shr, l, r, line),
            _ => unreachable!(),
        }
    }

    fn apply_arith(&mut self, op: OpCode, l: ExpDesc, r: ExpDesc, line: u32) -> ExpDesc {
        let lk = self.expr_to_rk(l, line);
        let rk = self.expr_to_rk(r, line);
        self.free_rk(rk);
        self.free_rk(lk);
        let dest = self.fs_mut().reserve_regs(1);
        self.fs_mut().emit_abc(op, dest as u32, lk, rk, line);
        ExpDesc::Reg(dest)
    }

    /// `a OP b` as a value (not a jump): `EQ/LT/LE a=1,B,C` skips the
    /// following `JMP` exactly when the comparison matches `expect`, and the
    /// `LOADBOOL ...,1` after it short-skips its own follower — see
    /// `vm::execute`'s `Test`/`Eq`/`Lt`/`Le` handlers for the truth table
    /// this depends on.
    fn apply_relational(&mut self, op: OpCode, expect: bool, l: ExpDesc, r: ExpDesc, line: u32) -> ExpDesc {
        let lk = self.expr_to_rk(l, line);
        let rk = self.expr_to_rk(r, line);
        self.free_rk(rk);
        self.free_rk(lk);
        let dest = self.fs_mut().reserve_regs(1);
        self.fs_mut().emit_abc(op, expect as u32, lk, rk, line);
        let jmp = self.fs_mut().emit_jump(line);
        self.fs_mut().emit_abc(OpCode::LoadBool, dest as u32, 0, 1, line);
        self.fs_mut().patch_jump_here(jmp);
        self.fs_mut().emit_abc(OpCode::LoadBool, dest as u32, 1, 0, line);
        ExpDesc::Reg(dest)
    }

    fn apply_concat(&mut self, l: ExpDesc, r: ExpDesc, line: u32) -> ExpDesc {
        let lr = self.discharge_to_next_reg(l, line);
        let rr = self.discharge_to_next_reg(r, line);
        self.fs_mut().free_reg(rr);
        self.fs_mut().free_reg(lr);
        let dest = self.fs_mut().reserve_regs(1);
        self.fs_mut().emit_abc(OpCode::Concat, dest as u32, lr as u32, rr as u32, line);
        ExpDesc::Reg(dest)
    }

    fn apply_and(&mut self, l: ExpDesc, r: ExpDesc, line: u32) -> ExpDesc {
        let dest = self.discharge_to_next_reg(l, line);
        let jmp = self.jump_if_false(dest, line);
        self.discharge_to_reg(r, dest, line);
        self.fs_mut().patch_jump_here(jmp);
        ExpDesc::Reg(dest)
    }

    fn apply_or(&mut self, l: ExpDesc, r: ExpDesc, line: u32) -> ExpDesc {
        let dest = self.discharge_to_next_reg(l, line);
        let jmp = self.jump_if_true(dest, line);
        self.discharge_to_reg(r, dest, line);
        self.fs_mut().patch_jump_here(jmp);
        ExpDesc::Reg(dest)
    }
}

fn unary_op(tok: TokenKind) -> Option<TokenKind> {
    use TokenKind::*;
    match tok {
        Minus | Not | Hash | Tilde => Some(tok),
        _ => None,
    }
}

fn bin_priority(tok: TokenKind) -> Option<(u8, u8)> {
    use TokenKind::*;
    Some(match tok {
        Or => (1, 1),
        And => (2, 2),
        Lt | Gt | Le | Ge | Ne | Eq => (3, 3),
        Pipe => (4, 4),
        Tilde => (5, 5),
        Amp => (6, 6),
        Shl | Shr => (7, 7),
        Concat => (9, 8),
        Plus | Minus => (10, 10),
        Star | Slash | IDiv | Percent => (11, 11),
        Caret => (14, 13),
        _ => return None,
    })
}
