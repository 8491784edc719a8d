//! json0 transform.
//!
//! `transform_component` rewrites one component against one concurrent
//! component; `transform_x` lifts it to whole ops by transforming each
//! side against the other, recursing when a component splits in two.

use super::component::{Component, Edit, PathSegment};
use super::{append, apply_component};
use crate::{OtError, Side};

/// Depth at which `b` edits inside the container `a` edits, or `None`
/// when neither contains the other. An empty path for `a` yields `-1`.
fn common_length(a: &Component, b: &Component) -> Option<isize> {
    let a_len = a.operand_len();
    let b_len = b.operand_len();
    if a_len == 0 {
        return Some(-1);
    }
    if b_len == 0 {
        return None;
    }
    let (a_len, b_len) = (a_len - 1, b_len - 1);
    for i in 0..a_len {
        if i >= b_len || a.path.get(i) != b.path.get(i) {
            return None;
        }
    }
    Some(a_len as isize)
}

fn seg(path: &[PathSegment], at: isize) -> Option<&PathSegment> {
    usize::try_from(at).ok().and_then(|i| path.get(i))
}

fn idx(path: &[PathSegment], at: isize) -> Option<usize> {
    seg(path, at).and_then(PathSegment::as_index)
}

fn set_index(path: &mut [PathSegment], at: isize, value: isize) {
    if let Some(PathSegment::Index(i)) = usize::try_from(at).ok().and_then(|at| path.get_mut(at)) {
        *i = value.max(0) as usize;
    }
}

fn shift(path: &mut [PathSegment], at: isize, delta: isize) {
    if let Some(i) = idx(path, at) {
        set_index(path, at, i as isize + delta);
    }
}

fn lt(a: Option<usize>, b: Option<usize>) -> bool {
    matches!((a, b), (Some(a), Some(b)) if a < b)
}

fn le(a: Option<usize>, b: Option<usize>) -> bool {
    matches!((a, b), (Some(a), Some(b)) if a <= b)
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Transforms `c` against the concurrent `other`, appending the result
/// (zero, one or two components) to `dest`.
pub(crate) fn transform_component(
    dest: &mut Vec<Component>,
    c: &Component,
    other: &Component,
    side: Side,
) -> Result<(), OtError> {
    let mut c = c.clone();
    let common = common_length(other, &c);
    let common2 = common_length(&c, other);
    let c_len = c.operand_len();
    let other_len = other.operand_len();

    // If c deletes something other edits, keep the deleted value current
    // so c stays invertible.
    if let Some(common2) = common2 {
        if other_len > c_len && seg(&c.path, common2) == seg(&other.path, common2) {
            let inner = || Component::new(other.path[c_len..].to_vec(), other.edit.clone());
            if let Some(deleted) = c.edit.ld().cloned() {
                c.edit.set_ld(apply_component(deleted, &inner())?);
            } else if let Some(deleted) = c.edit.od().cloned() {
                c.edit.set_od(apply_component(deleted, &inner())?);
            }
        }
    }

    let Some(common) = common else {
        append(dest, c);
        return Ok(());
    };
    let common_operand = c_len == other_len;
    let same_slot = |c: &Component| seg(&c.path, common) == seg(&other.path, common);

    match &other.edit {
        Edit::StringInsert(_) | Edit::StringDelete(_) => {
            if c.edit.is_string() && c.path.len() == other.path.len() && same_container(&c, other) {
                return transform_string(dest, c, other, side);
            }
        }
        Edit::NumberAdd(_) => {}
        Edit::ListReplace { after, .. } => {
            if same_slot(&c) {
                if !common_operand {
                    return Ok(());
                }
                if c.edit.ld().is_some() {
                    // Both replacing the same element: only one survives.
                    if c.edit.li().is_some() && side == Side::Left {
                        c.edit.set_ld(after.clone());
                    } else {
                        return Ok(());
                    }
                }
            }
        }
        Edit::ListInsert(_) => {
            let other_i = idx(&other.path, common);
            if c.edit.li().is_some() && c.edit.ld().is_none() && common_operand && same_slot(&c) {
                if side == Side::Right {
                    shift(&mut c.path, common, 1);
                }
            } else if le(other_i, idx(&c.path, common)) {
                shift(&mut c.path, common, 1);
            }
            if let Some(to) = c.edit.lm() {
                if common_operand && le(other_i, Some(to)) {
                    c.edit = Edit::ListMove(to + 1);
                }
            }
        }
        Edit::ListDelete(_) => {
            let other_i = idx(&other.path, common);
            if let Some(to) = c.edit.lm() {
                if common_operand {
                    if same_slot(&c) {
                        // They deleted the element we are moving.
                        return Ok(());
                    }
                    let from = idx(&c.path, common);
                    if lt(other_i, Some(to)) || (other_i == Some(to) && lt(from, Some(to))) {
                        c.edit = Edit::ListMove(to.saturating_sub(1));
                    }
                }
            }
            if lt(other_i, idx(&c.path, common)) {
                shift(&mut c.path, common, -1);
            } else if same_slot(&c) {
                if other_len < c_len {
                    // c edits inside the deleted element.
                    return Ok(());
                }
                if c.edit.ld().is_some() {
                    if c.edit.li().is_some() {
                        c.edit.drop_ld();
                    } else {
                        return Ok(());
                    }
                }
            }
        }
        Edit::ListMove(other_to) => {
            let other_to = *other_to as isize;
            let other_from = idx(&other.path, common).map(|i| i as isize);
            if c.edit.lm().is_some() && c_len == other_len {
                if let (Some(from), Some(to), Some(other_from)) =
                    (idx(&c.path, common), c.edit.lm(), other_from)
                {
                    let (from, to) = (from as isize, to as isize);
                    match transform_move(from, to, other_from, other_to, side) {
                        Some((new_from, new_to)) => {
                            set_index(&mut c.path, common, new_from);
                            c.edit = Edit::ListMove(new_to.max(0) as usize);
                        }
                        None => return Ok(()),
                    }
                }
            } else if c.edit.li().is_some() && c.edit.ld().is_none() && common_operand {
                if let (Some(p), Some(from)) = (idx(&c.path, common), other_from) {
                    let p = p as isize;
                    let mut moved = p;
                    if p > from {
                        moved -= 1;
                    }
                    if p > other_to {
                        moved += 1;
                    }
                    set_index(&mut c.path, common, moved);
                }
            } else if let (Some(p), Some(from)) = (idx(&c.path, common), other_from) {
                // Anything that cares where its element went.
                let p = p as isize;
                let moved = if p == from {
                    other_to
                } else {
                    let mut moved = p;
                    if p > from {
                        moved -= 1;
                    }
                    if p > other_to || (p == other_to && from > other_to) {
                        moved += 1;
                    }
                    moved
                };
                set_index(&mut c.path, common, moved);
            }
        }
        Edit::ObjectReplace { after, .. } => {
            if same_slot(&c) {
                if c.edit.oi().is_some() && common_operand {
                    if side == Side::Right {
                        return Ok(());
                    }
                    c.edit.set_od(after.clone());
                } else {
                    return Ok(());
                }
            }
        }
        Edit::ObjectInsert(after) => {
            if c.edit.oi().is_some() && same_slot(&c) {
                if side == Side::Left {
                    append(dest, Component::new(c.path.clone(), Edit::ObjectDelete(after.clone())));
                } else {
                    return Ok(());
                }
            }
        }
        Edit::ObjectDelete(_) => {
            if same_slot(&c) {
                if !common_operand {
                    return Ok(());
                }
                if c.edit.oi().is_some() {
                    c.edit.drop_od();
                } else {
                    return Ok(());
                }
            }
        }
    }

    append(dest, c);
    Ok(())
}

/// Move against move. Returns the new `(from, to)`, or `None` when the
/// other side wins a tie and this move disappears.
fn transform_move(
    from: isize,
    to: isize,
    other_from: isize,
    other_to: isize,
    side: Side,
) -> Option<(isize, isize)> {
    if other_from == other_to {
        return Some((from, to));
    }
    let (mut new_from, mut new_to) = (from, to);

    if from == other_from {
        if side == Side::Right {
            return None;
        }
        new_from = other_to;
        if from == to {
            new_to = other_to;
        }
        return Some((new_from, new_to));
    }

    if from > other_from {
        new_from -= 1;
    }
    if from > other_to {
        new_from += 1;
    } else if from == other_to && other_from > other_to {
        new_from += 1;
        if from == to {
            new_to += 1;
        }
    }

    if to > other_from || (to == other_from && to > from) {
        new_to -= 1;
    }
    if to > other_to {
        new_to += 1;
    } else if to == other_to {
        let same_direction =
            (other_to > other_from && to > from) || (other_to < other_from && to < from);
        if same_direction {
            if side == Side::Right {
                new_to += 1;
            }
        } else if to > from {
            new_to += 1;
        } else if to == other_from {
            new_to -= 1;
        }
    }
    Some((new_from, new_to))
}

fn same_container(a: &Component, b: &Component) -> bool {
    let n = a.path.len().saturating_sub(1);
    a.path[..n] == b.path[..n]
}

/// Where a string offset lands after a concurrent string edit.
fn shift_offset(pos: usize, other: &Component, insert_after: bool) -> usize {
    let Some(at) = other.last_index() else {
        return pos;
    };
    match &other.edit {
        Edit::StringInsert(s) => {
            if at < pos || (at == pos && insert_after) {
                pos + char_len(s)
            } else {
                pos
            }
        }
        Edit::StringDelete(s) => {
            let len = char_len(s);
            if pos <= at {
                pos
            } else if pos <= at + len {
                at
            } else {
                pos - len
            }
        }
        _ => pos,
    }
}

/// String edit against a string edit on the same string.
fn transform_string(
    dest: &mut Vec<Component>,
    c: Component,
    other: &Component,
    side: Side,
) -> Result<(), OtError> {
    let (Some(c_at), Some(other_at)) = (c.last_index(), other.last_index()) else {
        append(dest, c);
        return Ok(());
    };
    let at = |offset: usize, edit: Edit| {
        let mut path = c.path.clone();
        if let Some(last) = path.last_mut() {
            *last = PathSegment::Index(offset);
        }
        Component::new(path, edit)
    };

    match (&c.edit, &other.edit) {
        (Edit::StringInsert(_), _) => {
            let offset = shift_offset(c_at, other, side == Side::Right);
            append(dest, at(offset, c.edit.clone()));
        }
        (Edit::StringDelete(s), Edit::StringInsert(inserted)) => {
            let chars: Vec<char> = s.chars().collect();
            let mut rest = &chars[..];
            if c_at < other_at {
                let split = (other_at - c_at).min(chars.len());
                append(dest, at(c_at, Edit::StringDelete(chars[..split].iter().collect())));
                rest = &chars[split..];
            }
            if !rest.is_empty() {
                append(
                    dest,
                    at(c_at + char_len(inserted), Edit::StringDelete(rest.iter().collect())),
                );
            }
        }
        (Edit::StringDelete(s), Edit::StringDelete(other_s)) => {
            let chars: Vec<char> = s.chars().collect();
            let other_chars: Vec<char> = other_s.chars().collect();
            let (len, other_len) = (chars.len(), other_chars.len());

            if c_at >= other_at + other_len {
                append(dest, at(c_at - other_len, c.edit.clone()));
            } else if c_at + len <= other_at {
                append(dest, c);
            } else {
                let mut kept = String::new();
                if c_at < other_at {
                    kept.extend(&chars[..other_at - c_at]);
                }
                if c_at + len > other_at + other_len {
                    kept.extend(&chars[other_at + other_len - c_at..]);
                }

                let start = c_at.max(other_at);
                let end = (c_at + len).min(other_at + other_len);
                if chars[start - c_at..end - c_at] != other_chars[start - other_at..end - other_at] {
                    return Err(OtError::Transform(
                        "Delete ops delete different text in the same region of the document".into(),
                    ));
                }
                if !kept.is_empty() {
                    append(dest, at(shift_offset(c_at, other, false), Edit::StringDelete(kept)));
                }
            }
        }
        _ => append(dest, c),
    }
    Ok(())
}

/// Transforms `left` and `right` against each other, returning
/// `(left', right')`.
pub(crate) fn transform_x(
    mut left: Vec<Component>,
    right: Vec<Component>,
) -> Result<(Vec<Component>, Vec<Component>), OtError> {
    let mut new_right = Vec::new();

    for right_component in right {
        let mut pending = Some(right_component);
        let mut new_left = Vec::new();
        let mut k = 0;

        while k < left.len() {
            let Some(rc) = pending.take() else { break };
            let mut next = Vec::new();
            transform_component(&mut new_left, &left[k], &rc, Side::Left)?;
            transform_component(&mut next, &rc, &left[k], Side::Right)?;
            k += 1;

            match next.len() {
                1 => pending = next.pop(),
                0 => {
                    for c in &left[k..] {
                        append(&mut new_left, c.clone());
                    }
                    break;
                }
                _ => {
                    let (l, r) = transform_x(left[k..].to_vec(), next)?;
                    for c in l {
                        append(&mut new_left, c);
                    }
                    for c in r {
                        append(&mut new_right, c);
                    }
                    break;
                }
            }
        }

        if let Some(rc) = pending {
            append(&mut new_right, rc);
        }
        left = new_left;
    }

    Ok((left, new_right))
}

pub(crate) fn transform(
    op: Vec<Component>,
    other: Vec<Component>,
    side: Side,
) -> Result<Vec<Component>, OtError> {
    if other.is_empty() {
        return Ok(op);
    }
    if op.len() == 1 && other.len() == 1 {
        let mut dest = Vec::new();
        transform_component(&mut dest, &op[0], &other[0], side)?;
        return Ok(dest);
    }
    match side {
        Side::Left => Ok(transform_x(op, other)?.0),
        Side::Right => Ok(transform_x(other, op)?.1),
    }
}
