//! Pass 1: the precompile pass.
//!
//! Registers every class, interface, delegate signature, alias, member
//! variable slot and function signature of a compilation unit, and
//! resolves imports recursively, so that pass 2 never has to defer a
//! forward reference. Function bodies are skipped over; pass 2 seeks
//! back to them.

use beryl_bytecode::segment::{func_flags, type_flags, FuncInfo, Segments, TypeFamily, NO_METHOD};
use beryl_bytecode::type_ids;
use beryl_parser::{Span, Token, TokenStream};

use crate::compiler::{Compiler, GlobalInit};
use crate::error::CompileErrorKind;
use crate::model::{class_mods, CClass, CFunc, CVarDecl, Param, SigMatch, Signature};

type DeclResult<T> = Result<T, CompileErrorKind>;

/// Run pass 1 over one unit.
pub(crate) fn precompile(comp: &mut Compiler, seg: &mut Segments, unit_idx: usize) {
    let mut ts = take_tokens(comp, unit_idx);
    let file = comp.units[unit_idx].name.clone();

    while !ts.at_eof() {
        let span = ts.span();
        if let Err(kind) = top_level_decl(comp, seg, &mut ts, unit_idx) {
            comp.report_at(kind, &file, span.line, span.column);
            recover(&mut ts);
        }
    }

    restore_tokens(comp, unit_idx, ts);
}

/// Swap a unit's token stream out so the compiler stays borrowable
/// while parsing. Restored by [`restore_tokens`].
pub(crate) fn take_tokens(comp: &mut Compiler, unit_idx: usize) -> TokenStream {
    std::mem::replace(
        &mut comp.units[unit_idx].tokens,
        TokenStream::new(vec![(Token::Eof, Span::default())]),
    )
}

pub(crate) fn restore_tokens(comp: &mut Compiler, unit_idx: usize, ts: TokenStream) {
    comp.units[unit_idx].tokens = ts;
}

/// Error recovery: skip to just past the next statement boundary.
pub(crate) fn recover(ts: &mut TokenStream) {
    let mut depth = 0i32;
    loop {
        match ts.peek() {
            Token::Eof => return,
            Token::Semicolon if depth == 0 => {
                ts.next();
                return;
            }
            Token::LBrace => {
                depth += 1;
                ts.next();
            }
            Token::RBrace => {
                if depth == 0 {
                    return;
                }
                depth -= 1;
                ts.next();
                if depth == 0 {
                    return;
                }
            }
            _ => {
                ts.next();
            }
        }
    }
}

fn top_level_decl(
    comp: &mut Compiler,
    seg: &mut Segments,
    ts: &mut TokenStream,
    unit_idx: usize,
) -> DeclResult<()> {
    let span = ts.span();
    match ts.peek().clone() {
        Token::Option => {
            ts.next();
            let text = match ts.next() {
                Token::StrLit(s) => s,
                other => return Err(CompileErrorKind::UnexpectedToken(other.describe())),
            };
            expect(ts, &Token::Semicolon)?;
            if let Err(kind) = comp.options.parse(&text) {
                return Err(kind);
            }
            Ok(())
        }
        Token::Import => {
            ts.next();
            let name = expect_ident(ts)?;
            expect(ts, &Token::Semicolon)?;
            comp.resolve_import(seg, &name, span.line, span.column);
            Ok(())
        }
        Token::Alias => {
            ts.next();
            let target = expect_ident(ts)?;
            let new_name = expect_ident(ts)?;
            expect(ts, &Token::Semicolon)?;
            let id = comp
                .find_type(&target)
                .ok_or(CompileErrorKind::UndefinedType(target))?;
            if comp.type_map.contains_key(&new_name) {
                return Err(CompileErrorKind::IdentifierAlreadyDefined(new_name));
            }
            comp.type_map.insert(new_name.clone(), id);
            if let Some(class) = comp.class_of_mut(id) {
                class.aliases.push(new_name);
            }
            Ok(())
        }
        Token::Class | Token::Interface | Token::Native | Token::Strict | Token::Extern => {
            class_decl(comp, seg, ts, unit_idx)
        }
        Token::Delegate => delegate_decl(comp, seg, ts),
        Token::Function => {
            ts.next();
            function_decl(comp, seg, ts, unit_idx, type_ids::GLOBAL, 0)
        }
        Token::Cofunction => {
            ts.next();
            cofunction_decl(comp, seg, ts, unit_idx)
        }
        Token::SelfTest => {
            // Reserved keyword with no semantics; warn and skip.
            ts.next();
            comp.report_at(
                CompileErrorKind::SelfTestIgnored,
                &comp.units[unit_idx].name.clone(),
                span.line,
                span.column,
            );
            recover(ts);
            Ok(())
        }
        Token::Goto | Token::Namespace | Token::Using | Token::Clause | Token::Array => {
            let word = ts.next();
            recover(ts);
            Err(CompileErrorKind::ReservedKeyword(word.lexeme().to_string()))
        }
        _ => global_var_decl(comp, seg, ts, unit_idx),
    }
}

// ===== Classes =====

fn class_decl(
    comp: &mut Compiler,
    seg: &mut Segments,
    ts: &mut TokenStream,
    unit_idx: usize,
) -> DeclResult<()> {
    let mut modifiers = 0u32;
    loop {
        match ts.peek() {
            Token::Native => {
                modifiers |= class_mods::NATIVE_INTERFACE;
                ts.next();
            }
            Token::Strict => {
                modifiers |= class_mods::STRICT;
                ts.next();
            }
            Token::Extern => {
                modifiers |= class_mods::EXTERN;
                ts.next();
            }
            _ => break,
        }
    }
    if comp.native_mode {
        modifiers |= class_mods::NATIVE_BINDING;
    }

    let family = match ts.next() {
        Token::Class => TypeFamily::Class,
        Token::Interface => TypeFamily::Interface,
        other => return Err(CompileErrorKind::UnexpectedToken(other.describe())),
    };
    let name = expect_ident(ts)?;

    // Optional documentation tag: class Foo ["tag"]
    let mut tag = String::new();
    if ts.peek() == &Token::LBracket {
        ts.next();
        if let Token::StrLit(s) = ts.next() {
            tag = s;
        } else {
            return Err(CompileErrorKind::SyntaxError);
        }
        expect(ts, &Token::RBracket)?;
    }

    // Inheritance clauses.
    let mut base_id = 0u32;
    let mut hybrid_id = 0u32;
    loop {
        match ts.peek() {
            Token::Extends | Token::Implements | Token::Inherits => {
                ts.next();
                let base_name = expect_ident(ts)?;
                let id = comp
                    .find_type(&base_name)
                    .ok_or(CompileErrorKind::UndefinedType(base_name.clone()))?;
                let base = comp
                    .class_of(id)
                    .ok_or(CompileErrorKind::UndefinedType(base_name.clone()))?;
                if base.family != TypeFamily::Interface {
                    return Err(CompileErrorKind::NotAnInterface(base_name));
                }
                if !base.has_body {
                    return Err(CompileErrorKind::ClassWithoutBody(base_name));
                }
                base_id = id;
            }
            Token::Hybrid => {
                ts.next();
                let base_name = expect_ident(ts)?;
                let id = comp
                    .find_type(&base_name)
                    .ok_or(CompileErrorKind::UndefinedType(base_name.clone()))?;
                let base = comp
                    .class_of(id)
                    .ok_or(CompileErrorKind::UndefinedType(base_name.clone()))?;
                if base.family != TypeFamily::Class {
                    return Err(CompileErrorKind::NotAClass(base_name));
                }
                if !base.has_body {
                    return Err(CompileErrorKind::ClassWithoutBody(base_name));
                }
                hybrid_id = id;
            }
            _ => break,
        }
    }

    // Register or re-open the type. Forward declarations may repeat;
    // a second definition with a body is an error.
    let type_id = match comp.find_type(&name) {
        Some(id) => {
            let existing = comp
                .class_of(id)
                .ok_or_else(|| CompileErrorKind::IdentifierAlreadyDefined(name.clone()))?;
            if existing.family != family
                || (existing.has_body && ts.peek() == &Token::LBrace)
            {
                return Err(CompileErrorKind::IdentifierAlreadyDefined(name));
            }
            id
        }
        None => {
            let id = seg.add_type(family, &name);
            comp.type_map.insert(name.clone(), id);
            comp.classes.push(CClass::new(&name, id, family));
            id
        }
    };

    {
        let class = comp.class_of_mut(type_id).unwrap();
        class.modifiers |= modifiers;
        class.base_id = base_id;
        class.hybrid_id = hybrid_id;
        if !tag.is_empty() {
            class.tag = tag;
        }
    }
    seg.types[type_id as usize].base_id = base_id;
    seg.types[type_id as usize].hybrid_id = hybrid_id;
    if comp.native_mode {
        seg.types[type_id as usize].flags |= type_flags::NATIVE;
    }
    if modifiers & class_mods::STRICT != 0 {
        seg.types[type_id as usize].flags |= type_flags::STRICT;
    }

    if ts.eat(&Token::Semicolon) {
        return Ok(());
    }
    expect(ts, &Token::LBrace)?;
    comp.class_of_mut(type_id).unwrap().has_body = true;

    // Hybrid classes start with the base's member layout.
    if hybrid_id != 0 {
        let inherited: Vec<CVarDecl> = comp
            .class_of(hybrid_id)
            .map(|b| b.vars.clone())
            .unwrap_or_default();
        let class = comp.class_of_mut(type_id).unwrap();
        if class.vars.is_empty() {
            class.vars = inherited;
        }
    }

    while ts.peek() != &Token::RBrace {
        if ts.at_eof() {
            return Err(CompileErrorKind::UnexpectedEof);
        }
        let span = ts.span();
        if let Err(kind) = member_decl(comp, seg, ts, unit_idx, type_id, family) {
            let file = comp.units[unit_idx].name.clone();
            comp.report_at(kind, &file, span.line, span.column);
            recover(ts);
        }
    }
    ts.next(); // consume '}'
    Ok(())
}

fn member_decl(
    comp: &mut Compiler,
    seg: &mut Segments,
    ts: &mut TokenStream,
    unit_idx: usize,
    type_id: u32,
    family: TypeFamily,
) -> DeclResult<()> {
    let mut is_private = false;
    let mut flags = 0u32;
    loop {
        match ts.peek() {
            Token::Private => {
                is_private = true;
                ts.next();
            }
            Token::Explicit => {
                flags |= func_flags::EXPLICIT;
                ts.next();
            }
            Token::Virtual => {
                flags |= func_flags::VIRTUAL;
                ts.next();
            }
            _ => break,
        }
    }

    match ts.peek().clone() {
        Token::Method => {
            ts.next();
            method_decl(comp, seg, ts, unit_idx, type_id, flags)
        }
        Token::Accessor => {
            ts.next();
            accessor_decl(comp, seg, ts, unit_idx, type_id, flags)
        }
        Token::Convertor => {
            ts.next();
            convertor_decl(comp, seg, ts, unit_idx, type_id, flags)
        }
        Token::Function => {
            ts.next();
            if comp.native_mode {
                // Native declarations may carry static functions.
                function_decl(comp, seg, ts, unit_idx, type_id, flags)
            } else {
                Err(CompileErrorKind::FunctionAtClassScope)
            }
        }
        Token::Cofunction => {
            ts.next();
            Err(CompileErrorKind::FunctionAtClassScope)
        }
        _ => {
            if flags & func_flags::EXPLICIT != 0 {
                return Err(CompileErrorKind::BadExplicitModifier);
            }
            member_var_decl(comp, ts, type_id, is_private, family)
        }
    }
}

/// `method [ret] name (params)`: plain methods and constructors
/// (method name equals the class name, no return type).
fn method_decl(
    comp: &mut Compiler,
    seg: &mut Segments,
    ts: &mut TokenStream,
    unit_idx: usize,
    type_id: u32,
    mut flags: u32,
) -> DeclResult<()> {
    let class_name = comp.class_of(type_id).map(|c| c.name.clone()).unwrap_or_default();
    let (ret, name) = if ts.peek() == &Token::Var {
        ts.next();
        (type_ids::VAR, expect_ident(ts)?)
    } else {
        let first = expect_ident(ts)?;
        if ts.peek() == &Token::LParen {
            if first == class_name {
                flags |= func_flags::CTOR;
            }
            (type_ids::UNDEFINED, first)
        } else {
            let ret = comp
                .find_type(&first)
                .ok_or(CompileErrorKind::UndefinedType(first))?;
            (ret, expect_ident(ts)?)
        }
    };

    if flags & func_flags::EXPLICIT != 0 && flags & func_flags::CTOR == 0 {
        return Err(CompileErrorKind::BadExplicitModifier);
    }

    let params = parse_params(comp, ts)?;
    let sig = Signature {
        params,
        ret,
        ret_weak: false,
    };
    flags |= func_flags::METHOD;
    if flags & func_flags::CTOR != 0 && sig.params.len() == 1 && sig.params[0].type_id == type_id {
        flags |= func_flags::CCTOR;
    }
    register_function(comp, seg, ts, unit_idx, type_id, &name, sig, flags)
}

/// `accessor [type] name (params)`: zero parameters and a matching
/// return type read a member; one matching parameter writes it.
fn accessor_decl(
    comp: &mut Compiler,
    seg: &mut Segments,
    ts: &mut TokenStream,
    unit_idx: usize,
    type_id: u32,
    mut flags: u32,
) -> DeclResult<()> {
    if flags & func_flags::EXPLICIT != 0 {
        return Err(CompileErrorKind::BadExplicitModifier);
    }
    let first = expect_ident(ts)?;
    let (ret, name) = if ts.peek() == &Token::LParen {
        (type_ids::UNDEFINED, first)
    } else {
        let ret = comp
            .find_type(&first)
            .ok_or(CompileErrorKind::UndefinedType(first))?;
        (ret, expect_ident(ts)?)
    };
    let params = parse_params(comp, ts)?;

    let reader = params.is_empty() && ret != type_ids::UNDEFINED;
    let writer = params.len() == 1 && ret == type_ids::UNDEFINED;
    if !reader && !writer {
        return Err(CompileErrorKind::BadAccessorSignature);
    }
    // When a member variable of the same name exists its type must
    // match the accessed value.
    if let Some(var) = comp.class_of(type_id).and_then(|c| c.find_var(&name)) {
        let accessed = if reader { ret } else { params[0].type_id };
        if var.type_id != accessed {
            return Err(CompileErrorKind::BadAccessorSignature);
        }
    }

    flags |= func_flags::METHOD | func_flags::ACCESSOR;
    let sig = Signature {
        params,
        ret,
        ret_weak: false,
    };
    register_function(comp, seg, ts, unit_idx, type_id, &name, sig, flags)
}

/// `convertor <type> ()`: conversion method named after its target.
fn convertor_decl(
    comp: &mut Compiler,
    seg: &mut Segments,
    ts: &mut TokenStream,
    unit_idx: usize,
    type_id: u32,
    mut flags: u32,
) -> DeclResult<()> {
    let target = expect_ident(ts)?;
    let ret = comp
        .find_type(&target)
        .ok_or(CompileErrorKind::UndefinedType(target.clone()))?;
    if ret == type_ids::UNDEFINED {
        return Err(CompileErrorKind::SyntaxError);
    }
    let params = parse_params(comp, ts)?;
    if !params.is_empty() {
        return Err(CompileErrorKind::SyntaxError);
    }
    flags |= func_flags::METHOD | func_flags::CONVERTOR;
    let sig = Signature {
        params,
        ret,
        ret_weak: false,
    };
    register_function(comp, seg, ts, unit_idx, type_id, &target, sig, flags)
}

fn member_var_decl(
    comp: &mut Compiler,
    ts: &mut TokenStream,
    type_id: u32,
    is_private: bool,
    family: TypeFamily,
) -> DeclResult<()> {
    if family == TypeFamily::Interface {
        return Err(CompileErrorKind::UnexpectedToken(ts.peek().describe()));
    }
    let mut is_const = false;
    let mut is_weak = false;
    loop {
        match ts.peek() {
            Token::Const => {
                is_const = true;
                ts.next();
            }
            Token::Weak => {
                is_weak = true;
                ts.next();
            }
            _ => break,
        }
    }
    let var_type = parse_type(comp, ts)?;
    if is_weak && matches!(var_type, type_ids::INT | type_ids::FLOAT) {
        return Err(CompileErrorKind::WeakNeedsReference);
    }
    loop {
        let name = expect_ident(ts)?;
        let class = comp.class_of_mut(type_id).unwrap();
        if class.find_var(&name).is_some() {
            return Err(CompileErrorKind::IdentifierAlreadyDefined(name));
        }
        let slot = class.vars.len() as u32;
        class.vars.push(CVarDecl {
            name,
            type_id: var_type,
            is_const,
            is_weak,
            is_private,
            slot,
        });
        if !ts.eat(&Token::Comma) {
            break;
        }
    }
    if ts.peek() == &Token::Assign {
        // Member variables initialize in constructors.
        return Err(CompileErrorKind::SyntaxError);
    }
    expect(ts, &Token::Semicolon)?;
    Ok(())
}

// ===== Delegates, cofunctions, global functions =====

/// `delegate [ret] name (params);`
fn delegate_decl(comp: &mut Compiler, seg: &mut Segments, ts: &mut TokenStream) -> DeclResult<()> {
    ts.next(); // 'delegate'
    let (ret, name) = ret_and_name(comp, ts)?;
    let params = parse_params(comp, ts)?;
    expect(ts, &Token::Semicolon)?;

    if comp.type_map.contains_key(&name) {
        return Err(CompileErrorKind::IdentifierAlreadyDefined(name));
    }
    let id = seg.add_type(TypeFamily::Delegate, &name);
    comp.type_map.insert(name.clone(), id);
    let mut class = CClass::new(&name, id, TypeFamily::Delegate);
    class.delegate_sig = Some(Signature {
        params,
        ret,
        ret_weak: false,
    });
    class.has_body = true;
    comp.classes.push(class);
    Ok(())
}

/// `cofunction [ret] name (params) { body }`: registers both the
/// restartable function and the thread-family type used to instantiate
/// it.
fn cofunction_decl(
    comp: &mut Compiler,
    seg: &mut Segments,
    ts: &mut TokenStream,
    unit_idx: usize,
) -> DeclResult<()> {
    let (ret, name) = ret_and_name(comp, ts)?;
    let params = parse_params(comp, ts)?;
    let sig = Signature {
        params,
        ret,
        ret_weak: false,
    };

    if comp.type_map.contains_key(&name) {
        return Err(CompileErrorKind::IdentifierAlreadyDefined(name));
    }
    let id = seg.add_type(TypeFamily::Thread, &name);
    comp.type_map.insert(name.clone(), id);
    let mut class = CClass::new(&name, id, TypeFamily::Thread);
    class.delegate_sig = Some(sig.clone());
    class.has_body = true;

    let cfunc_idx = comp.funcs.len();
    class.funcs.push(cfunc_idx);
    comp.classes.push(class);

    register_function(
        comp,
        seg,
        ts,
        unit_idx,
        type_ids::GLOBAL,
        &name,
        sig,
        func_flags::COFUNC,
    )
}

/// Parse `[type] name` in a function heading; a bare name means void.
fn ret_and_name(comp: &Compiler, ts: &mut TokenStream) -> DeclResult<(u32, String)> {
    if ts.eat(&Token::Var) {
        return Ok((type_ids::VAR, expect_ident(ts)?));
    }
    let first = expect_ident(ts)?;
    if ts.peek() == &Token::LParen {
        Ok((type_ids::UNDEFINED, first))
    } else {
        let ret = comp
            .find_type(&first)
            .ok_or(CompileErrorKind::UndefinedType(first))?;
        Ok((ret, expect_ident(ts)?))
    }
}

/// Global function after the `function` keyword, or native static
/// function inside a native class declaration.
fn function_decl(
    comp: &mut Compiler,
    seg: &mut Segments,
    ts: &mut TokenStream,
    unit_idx: usize,
    owner: u32,
    flags: u32,
) -> DeclResult<()> {
    let (ret, name) = ret_and_name(comp, ts)?;
    let params = parse_params(comp, ts)?;
    let sig = Signature {
        params,
        ret,
        ret_weak: false,
    };
    register_function(comp, seg, ts, unit_idx, owner, &name, sig, flags)
}

fn global_var_decl(
    comp: &mut Compiler,
    seg: &mut Segments,
    ts: &mut TokenStream,
    unit_idx: usize,
) -> DeclResult<()> {
    let mut is_const = false;
    let mut is_weak = false;
    loop {
        match ts.peek() {
            Token::Const => {
                is_const = true;
                ts.next();
            }
            Token::Weak => {
                is_weak = true;
                ts.next();
            }
            _ => break,
        }
    }
    let var_type = parse_type(comp, ts)?;
    let name = expect_ident(ts)?;
    if comp.find_global(&name).is_some() {
        return Err(CompileErrorKind::IdentifierAlreadyDefined(name));
    }
    let slot = comp.globals.len() as u32;
    comp.globals.push(CVarDecl {
        name,
        type_id: var_type,
        is_const,
        is_weak,
        is_private: false,
        slot,
    });

    if ts.eat(&Token::Assign) {
        // Defer the initializer expression to pass 2.
        comp.global_inits.push(GlobalInit {
            slot,
            unit: unit_idx,
            tok: ts.tell(),
        });
        skip_expression(ts);
    } else if is_const {
        return Err(CompileErrorKind::ConstNeedsInit);
    }
    expect(ts, &Token::Semicolon)?;
    Ok(())
}

// ===== Shared registration =====

/// Register one function signature, enforcing the overload rules, and
/// skip its body if present.
#[allow(clippy::too_many_arguments)]
fn register_function(
    comp: &mut Compiler,
    seg: &mut Segments,
    ts: &mut TokenStream,
    unit_idx: usize,
    owner: u32,
    name: &str,
    sig: Signature,
    mut flags: u32,
) -> DeclResult<()> {
    if comp.native_mode {
        flags |= func_flags::NATIVE;
    }

    let body_tok = if ts.peek() == &Token::LBrace {
        let tok = ts.tell();
        skip_balanced_braces(ts);
        Some(tok)
    } else {
        expect(ts, &Token::Semicolon)?;
        None
    };

    // Check against existing overloads of the same name.
    for fi in comp.funcs_named(owner, name) {
        let existing = &comp.funcs[fi];
        match sig.match_against(&existing.sig) {
            SigMatch::Distinct => continue,
            SigMatch::VarConflict => {
                return Err(CompileErrorKind::VarArgumentConflict(name.to_string()))
            }
            SigMatch::ConstConflict => {
                return Err(CompileErrorKind::ConstModifierConflict(name.to_string()))
            }
            SigMatch::WeakConflict => {
                return Err(CompileErrorKind::WeakModifierConflict(name.to_string()))
            }
            SigMatch::Same => {
                if existing.flags & !func_flags::STRICT != flags & !func_flags::STRICT {
                    return Err(CompileErrorKind::FunctionAlreadyDefined(name.to_string()));
                }
                return match (existing.body_tok, body_tok) {
                    (Some(_), Some(_)) => {
                        Err(CompileErrorKind::FunctionAlreadyDefined(name.to_string()))
                    }
                    (None, Some(tok)) => {
                        comp.funcs[fi].body_tok = Some(tok);
                        comp.funcs[fi].unit = unit_idx;
                        Ok(())
                    }
                    // Repeated forward declaration is legal.
                    _ => Ok(()),
                };
            }
        }
    }

    let is_method = flags & func_flags::METHOD != 0;
    let member_idx = if comp.native_mode {
        // Native functions are dispatched by declaration ordinal.
        comp.class_of(owner)
            .map(|c| c.funcs.len() as u32)
            .unwrap_or(0)
    } else if is_method {
        assign_member_slot(comp, owner, name, &sig)
    } else {
        NO_METHOD
    };

    if comp
        .class_of(owner)
        .map(|c| c.modifiers & class_mods::STRICT != 0)
        .unwrap_or(false)
    {
        flags |= func_flags::STRICT;
    }

    let name_offs = seg.cstr.add(name);
    let func_idx = seg.add_function(FuncInfo {
        type_id: owner,
        flags,
        code_addr: 0,
        code_size: 0,
        arg_count: sig.params.len() as u32,
        member_idx,
        name_offs,
    });

    let cfunc = CFunc {
        name: name.to_string(),
        func_idx,
        owner,
        flags,
        sig,
        member_idx,
        unit: unit_idx,
        body_tok,
        code: Vec::new(),
        capture_count: 0,
    };

    // Track special methods on the type entry.
    if is_method {
        let tinfo = &mut seg.types[owner as usize];
        if flags & func_flags::CCTOR != 0 {
            tinfo.methods.cctor = func_idx;
        } else if flags & func_flags::CTOR != 0 && cfunc.sig.params.is_empty() {
            tinfo.methods.ctor = func_idx;
        } else if flags & func_flags::CONVERTOR != 0 && cfunc.sig.ret == type_ids::STRING {
            tinfo.methods.tostr = func_idx;
        }
    }

    let idx = comp.funcs.len();
    comp.funcs.push(cfunc);
    if let Some(class) = comp.class_of_mut(owner) {
        if !class.funcs.contains(&idx) {
            class.funcs.push(idx);
        }
    }
    Ok(())
}

/// Pick the v-table slot for a new method: override the matching slot
/// of the base interface chain when the signature lines up, otherwise
/// append a fresh slot.
fn assign_member_slot(comp: &Compiler, owner: u32, name: &str, sig: &Signature) -> u32 {
    // Overriding a method of the base interface chain or the hybrid
    // implementation base reuses its slot.
    let (base_id, hybrid_id) = comp
        .class_of(owner)
        .map(|c| (c.base_id, c.hybrid_id))
        .unwrap_or((0, 0));
    for start in [base_id, hybrid_id] {
        let mut probe = start;
        while probe != 0 {
            let Some(base) = comp.class_of(probe) else { break };
            for &fi in &base.funcs {
                let f = &comp.funcs[fi];
                if f.name == name && matches!(sig.match_against(&f.sig), SigMatch::Same) {
                    return f.member_idx;
                }
            }
            probe = base.base_id;
        }
    }
    // Fresh slot after everything inherited or already assigned.
    let inherited = slot_count(comp, base_id).max(slot_count(comp, hybrid_id));
    let own_max = comp
        .class_of(owner)
        .map(|c| {
            c.funcs
                .iter()
                .map(|&fi| comp.funcs[fi].member_idx)
                .filter(|&m| m != NO_METHOD)
                .map(|m| m + 1)
                .max()
                .unwrap_or(0)
        })
        .unwrap_or(0);
    inherited.max(own_max)
}

/// Total v-table slots declared across a type's inheritance chain.
pub(crate) fn slot_count(comp: &Compiler, type_id: u32) -> u32 {
    let mut count = 0u32;
    let mut probe = type_id;
    while probe != 0 {
        if let Some(class) = comp.class_of(probe) {
            let own = class
                .funcs
                .iter()
                .map(|&fi| comp.funcs[fi].member_idx)
                .filter(|&m| m != NO_METHOD)
                .map(|m| m + 1)
                .max()
                .unwrap_or(0);
            count = count.max(own);
            probe = if class.base_id != 0 {
                class.base_id
            } else {
                class.hybrid_id
            };
        } else {
            break;
        }
    }
    count
}

// ===== Token helpers =====

pub(crate) fn expect(ts: &mut TokenStream, tok: &Token) -> DeclResult<()> {
    if ts.eat(tok) {
        Ok(())
    } else if tok == &Token::Semicolon {
        Err(CompileErrorKind::MissingSemicolon)
    } else if ts.at_eof() {
        Err(CompileErrorKind::UnexpectedEof)
    } else {
        Err(CompileErrorKind::UnexpectedToken(ts.peek().describe()))
    }
}

pub(crate) fn expect_ident(ts: &mut TokenStream) -> DeclResult<String> {
    match ts.next() {
        Token::Ident(name) => Ok(name),
        Token::Eof => Err(CompileErrorKind::UnexpectedEof),
        other => Err(CompileErrorKind::UnexpectedToken(other.describe())),
    }
}

/// Parse a type name in declaration position.
pub(crate) fn parse_type(comp: &Compiler, ts: &mut TokenStream) -> DeclResult<u32> {
    match ts.next() {
        Token::Var => Ok(type_ids::VAR),
        Token::Ident(name) => comp
            .find_type(&name)
            .ok_or(CompileErrorKind::UndefinedType(name)),
        Token::Eof => Err(CompileErrorKind::UnexpectedEof),
        other => Err(CompileErrorKind::UnexpectedToken(other.describe())),
    }
}

/// Parse `( [const|weak] type [name] {, …} )`.
pub(crate) fn parse_params(comp: &Compiler, ts: &mut TokenStream) -> DeclResult<Vec<Param>> {
    expect(ts, &Token::LParen)?;
    let mut params = Vec::new();
    if ts.eat(&Token::RParen) {
        return Ok(params);
    }
    loop {
        let mut is_const = false;
        let mut is_weak = false;
        loop {
            match ts.peek() {
                Token::Const => {
                    is_const = true;
                    ts.next();
                }
                Token::Weak => {
                    is_weak = true;
                    ts.next();
                }
                _ => break,
            }
        }
        let type_id = parse_type(comp, ts)?;
        let name = match ts.peek() {
            Token::Ident(n) => {
                let n = n.clone();
                ts.next();
                n
            }
            _ => String::new(),
        };
        params.push(Param {
            name,
            type_id,
            is_const,
            is_weak,
        });
        if ts.eat(&Token::RParen) {
            return Ok(params);
        }
        expect(ts, &Token::Comma)?;
    }
}

/// Skip over a balanced `{ … }` block. Assumes the stream is at `{`.
pub(crate) fn skip_balanced_braces(ts: &mut TokenStream) {
    debug_assert_eq!(ts.peek(), &Token::LBrace);
    let mut depth = 0i32;
    loop {
        match ts.next() {
            Token::LBrace => depth += 1,
            Token::RBrace => {
                depth -= 1;
                if depth == 0 {
                    return;
                }
            }
            Token::Eof => return,
            _ => {}
        }
    }
}

/// Skip an expression up to the next `;` or `,` at bracket depth zero.
pub(crate) fn skip_expression(ts: &mut TokenStream) {
    let mut depth = 0i32;
    loop {
        match ts.peek() {
            Token::Eof => return,
            Token::Semicolon if depth == 0 => return,
            Token::LParen | Token::LBrace | Token::LBracket => {
                depth += 1;
                ts.next();
            }
            Token::RParen | Token::RBrace | Token::RBracket => {
                if depth == 0 {
                    return;
                }
                depth -= 1;
                ts.next();
            }
            _ => {
                ts.next();
            }
        }
    }
}
