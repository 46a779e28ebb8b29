//! IP address helpers.

/// Expand an IPv6 address to its canonical 39-character long form.
///
/// Accepts optional surrounding brackets and mixed-case hex digits;
/// output groups are zero-padded lowercase. Returns `None` for
/// malformed input: unbalanced brackets, more than 39 characters, a
/// group longer than four digits, more than one `::`, or stray
/// characters.
///
/// # Example
///
/// ```rust
/// use aqueduct::iputils::ipv6_long_form;
///
/// assert_eq!(
///     ipv6_long_form("2001:db8::1").as_deref(),
///     Some("2001:0db8:0000:0000:0000:0000:0000:0001")
/// );
/// assert!(ipv6_long_form("1::2::3").is_none());
/// ```
pub fn ipv6_long_form(short_address: &str) -> Option<String> {
    let bytes = short_address.as_bytes();
    let inner = if bytes.first() == Some(&b'[') {
        if bytes.last() != Some(&b']') {
            return None;
        }
        &bytes[1..bytes.len() - 1]
    } else {
        bytes
    };
    if inner.len() < 2 || inner.len() > 39 {
        return None;
    }

    fn hex(c: u8) -> Option<u8> {
        match c {
            b'0'..=b'9' | b'a'..=b'f' => Some(c),
            b'A'..=b'F' => Some(c + (b'a' - b'A')),
            _ => None,
        }
    }

    let mut buf = *b"0000:0000:0000:0000:0000:0000:0000:0000";
    let mut start = 0usize;
    let mut end = inner.len();

    // Groups before a possible `::`, filled left to right.
    let mut left_groups = 0usize;
    while left_groups < 8 && start < end {
        let pos = inner[start..end]
            .iter()
            .position(|&c| c == b':')
            .map_or(end, |p| p + start);
        if pos == start {
            if left_groups == 0 {
                // Only `::` may begin with a colon.
                if inner.get(start + 1) != Some(&b':') {
                    return None;
                }
                start = pos + 1;
            }
            break;
        }
        let group_len = pos - start;
        if group_len > 4 {
            return None;
        }
        let out = 5 * left_groups + (4 - group_len);
        for (i, &c) in inner[start..pos].iter().enumerate() {
            buf[out + i] = hex(c)?;
        }
        left_groups += 1;
        start = pos + 1;
    }

    // Groups after the `::`, filled right to left.
    let mut right_groups = 0usize;
    while left_groups + right_groups < 8 && start < end {
        end -= 1;
        let pos = inner[..=end].iter().rposition(|&c| c == b':')?;
        let group_len = end - pos;
        if group_len == 0 {
            if left_groups > 0 || right_groups > 0 {
                // `:::`, or a second `::`.
                return None;
            }
            break;
        }
        if group_len > 4 {
            return None;
        }
        let mut out = 5 * (8 - right_groups) - 1;
        for i in (pos + 1..=end).rev() {
            out -= 1;
            buf[out] = hex(inner[i])?;
        }
        right_groups += 1;
        end = pos;
    }

    if start < end {
        // Too many groups.
        return None;
    }

    String::from_utf8(buf.to_vec()).ok()
}
