/// Decodes an `application/x-www-form-urlencoded` body into its fields, in
/// order. Invalid percent escapes are kept literally.
pub fn parse_urlencoded(body: &[u8]) -> Vec<(String, String)> {
    body.split(|byte| *byte == b'&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (name, value) = match pair.iter().position(|byte| *byte == b'=') {
                Some(split) => (&pair[..split], &pair[split + 1..]),
                None => (pair, &pair[pair.len()..]),
            };
            (decode_component(name), decode_component(value))
        })
        .collect()
}

fn decode_component(raw: &[u8]) -> String {
    let mut out = Vec::with_capacity(raw.len());
    let mut idx = 0;
    while idx < raw.len() {
        match raw[idx] {
            b'+' => {
                out.push(b' ');
                idx += 1;
            }
            b'%' if idx + 2 < raw.len() => {
                match (hex_value(raw[idx + 1]), hex_value(raw[idx + 2])) {
                    (Some(high), Some(low)) => {
                        out.push(high << 4 | low);
                        idx += 3;
                    }
                    _ => {
                        out.push(b'%');
                        idx += 1;
                    }
                }
            }
            byte => {
                out.push(byte);
                idx += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn pairs(items: &[(&str, &str)]) -> Vec<(String, String)> {
        items
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn decodes_plus_and_percent_escapes() {
        let fields = parse_urlencoded(
            b"ssid=My+Home&webhook=https%3A%2F%2Fexample.com%2Fhook&webhook_headers=A%3A+1%0D%0AB%3A+2",
        );
        assert_eq!(
            fields,
            pairs(&[
                ("ssid", "My Home"),
                ("webhook", "https://example.com/hook"),
                ("webhook_headers", "A: 1\r\nB: 2"),
            ])
        );
    }

    #[test]
    fn keeps_empty_and_valueless_fields() {
        let fields = parse_urlencoded(b"a=&b&&c=%");
        assert_eq!(fields, pairs(&[("a", ""), ("b", ""), ("c", "%")]));
    }

    #[test]
    fn decodes_utf8_sequences() {
        let fields = parse_urlencoded(b"ssid=Caf%C3%A9");
        assert_eq!(fields, pairs(&[("ssid", "Café")]));
    }

    #[test]
    fn invalid_escape_is_literal() {
        let fields = parse_urlencoded(b"password=100%zz");
        assert_eq!(fields, pairs(&[("password", "100%zz")]));
    }
}
