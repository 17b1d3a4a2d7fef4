/// Returns true if `ch` falls inside the bracket body `class` (the bytes
/// between `[` and `]`). Supports `^`/`!` negation, ranges and escapes.
fn class_match(class: &[u8], ch: u8) -> bool {
    let (negate, class) = match class.first() {
        Some(b'^') | Some(b'!') => (true, &class[1..]),
        _ => (false, class),
    };
    let mut i = 0;
    let mut found = false;
    while i < class.len() {
        let lo = if class[i] == b'\\' && i + 1 < class.len() {
            i += 1;
            class[i]
        } else {
            class[i]
        };
        if i + 2 < class.len() && class[i + 1] == b'-' {
            let hi = class[i + 2];
            let (lo, hi) = if lo <= hi { (lo, hi) } else { (hi, lo) };
            found |= (lo..=hi).contains(&ch);
            i += 3;
        } else {
            found |= lo == ch;
            i += 1;
        }
    }
    found != negate
}

/// Find the `]` closing a class that starts right after `[`, honouring escapes.
fn class_end(rest: &[u8]) -> Option<usize> {
    let mut i = 0;
    while i < rest.len() {
        match rest[i] {
            b'\\' => i += 2,
            b']' => return Some(i),
            _ => i += 1,
        }
    }
    None
}

/// Match one non-star pattern token against `ch`.
/// Returns the pattern length consumed, or `None` on mismatch.
fn match_token(pattern: &[u8], ch: u8) -> Option<usize> {
    match pattern[0] {
        b'?' => Some(1),
        b'\\' if pattern.len() > 1 => (pattern[1] == ch).then_some(2),
        b'[' => match class_end(&pattern[1..]) {
            Some(end) => class_match(&pattern[1..1 + end], ch).then_some(end + 2),
            // No closing `]`: the `[` is literal.
            None => (ch == b'[').then_some(1),
        },
        p => (p == ch).then_some(1),
    }
}

pub fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    let (mut p, mut t) = (0usize, 0usize);
    // Position of the last `*` seen and the text index it is currently absorbing up to.
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && pattern[p] == b'*' {
            star = Some((p, t));
            p += 1;
            continue;
        }
        if p < pattern.len() {
            if let Some(used) = match_token(&pattern[p..], text[t]) {
                p += used;
                t += 1;
                continue;
            }
        }
        match star {
            Some((sp, st)) => {
                p = sp + 1;
                t = st + 1;
                star = Some((sp, st + 1));
            }
            None => return false,
        }
    }
    pattern[p..].iter().all(|&b| b == b'*')
}
