//! Line ending normalization for text that ends up in mail bodies.
//!
//! Some SMTP servers reject bare line feeds inside the `DATA` payload, so
//! everything written into a job log uses `\r\n` exclusively.

use std::borrow::Cow;

/// Returns `true` if every `\r` is followed by `\n` and every `\n` is preceded by `\r`.
pub fn is_normalized(input: &[u8]) -> bool {
    input.iter().enumerate().all(|(i, &byte)| match byte {
        b'\r' => input.get(i + 1) == Some(&b'\n'),
        b'\n' => i > 0 && input[i - 1] == b'\r',
        _ => true,
    })
}

/// Rewrites all line endings of `input` to `\r\n`.
///
/// - a bare `\n` becomes `\r\n`
/// - an existing `\r\n` is kept as is
/// - a lone `\r` becomes `\r\n`
///
/// Already normalized input is returned borrowed.
pub fn normalize(input: &[u8]) -> Cow<'_, [u8]> {
    if is_normalized(input) {
        return Cow::Borrowed(input);
    }

    let mut output = Vec::with_capacity(input.len() + input.len() / 32 + 2);
    let mut bytes = input.iter().copied().peekable();
    while let Some(byte) = bytes.next() {
        match byte {
            b'\r' => {
                bytes.next_if_eq(&b'\n');
                output.extend_from_slice(b"\r\n");
            }
            b'\n' => output.extend_from_slice(b"\r\n"),
            other => output.push(other),
        }
    }

    Cow::Owned(output)
}

/// [normalize] for UTF-8 text.
pub fn normalize_str(input: &str) -> Cow<'_, str> {
    match normalize(input.as_bytes()) {
        Cow::Borrowed(_) => Cow::Borrowed(input),
        Cow::Owned(bytes) => Cow::Owned(String::from_utf8_lossy(&bytes).into_owned()),
    }
}
