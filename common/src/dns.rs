//! Minimal DNS responder codec for the captive portal: every address lookup
//! resolves to the access point itself.

use std::net::Ipv4Addr;

pub const DNS_PORT: u16 = 53;
const ANSWER_TTL_SECS: u32 = 60;
const HEADER_LEN: usize = 12;
const MAX_NAME_LEN: usize = 253;

pub const QTYPE_A: u16 = 1;
pub const QTYPE_ANY: u16 = 255;
const QCLASS_IN: u16 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuestion {
    pub name: String,
    pub qtype: u16,
    pub qclass: u16,
    /// Length of the encoded question, name plus type and class.
    encoded_len: usize,
}

/// Reads the first question of a standard query. Returns `None` for anything
/// that is not a well-formed query.
pub fn parse_question(packet: &[u8]) -> Option<DnsQuestion> {
    if packet.len() < HEADER_LEN {
        return None;
    }
    // Responses and non-standard opcodes are not ours to answer.
    if packet[2] & 0x80 != 0 || (packet[2] >> 3) & 0x0F != 0 {
        return None;
    }
    if u16::from_be_bytes([packet[4], packet[5]]) == 0 {
        return None;
    }

    let mut idx = HEADER_LEN;
    let mut name = String::new();
    loop {
        let label_len = *packet.get(idx)? as usize;
        idx += 1;
        if label_len == 0 {
            break;
        }
        // Compression pointers never appear in the question of a query.
        if label_len & 0xC0 != 0 || idx + label_len > packet.len() {
            return None;
        }
        let label = std::str::from_utf8(&packet[idx..idx + label_len]).ok()?;
        if !name.is_empty() {
            name.push('.');
        }
        name.push_str(label);
        if name.len() > MAX_NAME_LEN {
            return None;
        }
        idx += label_len;
    }

    let fixed = packet.get(idx..idx + 4)?;
    Some(DnsQuestion {
        name,
        qtype: u16::from_be_bytes([fixed[0], fixed[1]]),
        qclass: u16::from_be_bytes([fixed[2], fixed[3]]),
        encoded_len: idx + 4 - HEADER_LEN,
    })
}

/// Builds the reply to `query`. A and ANY questions are answered with
/// `answer_ip`; other types get an empty NOERROR reply.
pub fn build_response(query: &[u8], answer_ip: Ipv4Addr) -> Option<Vec<u8>> {
    let question = parse_question(query)?;
    let question_end = HEADER_LEN + question.encoded_len;
    let answers = question.answers_with_address();

    let mut response = Vec::with_capacity(question_end + 16);
    response.extend_from_slice(&query[0..2]);
    // QR, opcode 0, AA, keep RD; RA set, RCODE 0.
    response.push(0x84 | (query[2] & 0x01));
    response.push(0x80);
    response.extend_from_slice(&1_u16.to_be_bytes());
    response.extend_from_slice(&u16::from(answers).to_be_bytes());
    response.extend_from_slice(&[0, 0, 0, 0]);
    response.extend_from_slice(&query[HEADER_LEN..question_end]);

    if answers {
        response.extend_from_slice(&[0xC0, 0x0C]);
        response.extend_from_slice(&QTYPE_A.to_be_bytes());
        response.extend_from_slice(&QCLASS_IN.to_be_bytes());
        response.extend_from_slice(&ANSWER_TTL_SECS.to_be_bytes());
        response.extend_from_slice(&4_u16.to_be_bytes());
        response.extend_from_slice(&answer_ip.octets());
    }

    Some(response)
}

impl DnsQuestion {
    fn answers_with_address(&self) -> bool {
        matches!(self.qtype, QTYPE_A | QTYPE_ANY)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const AP_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 4, 1);

    fn query(id: u16, name: &str, qtype: u16) -> Vec<u8> {
        let mut packet = Vec::new();
        packet.extend_from_slice(&id.to_be_bytes());
        packet.extend_from_slice(&[0x01, 0x00, 0, 1, 0, 0, 0, 0, 0, 0]);
        for label in name.split('.') {
            packet.push(label.len() as u8);
            packet.extend_from_slice(label.as_bytes());
        }
        packet.push(0);
        packet.extend_from_slice(&qtype.to_be_bytes());
        packet.extend_from_slice(&1_u16.to_be_bytes());
        packet
    }

    #[test]
    fn parses_question_name_and_type() {
        let question = parse_question(&query(7, "connectivitycheck.gstatic.com", QTYPE_A)).unwrap();
        assert_eq!(question.name, "connectivitycheck.gstatic.com");
        assert_eq!(question.qtype, QTYPE_A);
        assert_eq!(question.qclass, 1);
    }

    #[test]
    fn a_query_resolves_to_access_point() {
        let request = query(0xBEEF, "captive.apple.com", QTYPE_A);
        let response = build_response(&request, AP_IP).unwrap();

        assert_eq!(&response[0..2], &[0xBE, 0xEF]);
        assert_eq!(response[2] & 0x80, 0x80);
        assert_eq!(response[3] & 0x0F, 0);
        assert_eq!(u16::from_be_bytes([response[6], response[7]]), 1);
        assert_eq!(&response[response.len() - 4..], &AP_IP.octets());
        assert_eq!(response.len(), request.len() + 16);
    }

    #[test]
    fn any_query_is_answered_too() {
        let response = build_response(&query(1, "example.com", QTYPE_ANY), AP_IP).unwrap();
        assert_eq!(&response[response.len() - 4..], &AP_IP.octets());
    }

    #[test]
    fn other_types_get_empty_answer() {
        let request = query(2, "example.com", 28);
        let response = build_response(&request, AP_IP).unwrap();

        assert_eq!(u16::from_be_bytes([response[6], response[7]]), 0);
        assert_eq!(response.len(), request.len());
        assert_eq!(response[3] & 0x0F, 0);
    }

    #[test]
    fn malformed_packets_are_ignored() {
        let valid = query(3, "example.com", QTYPE_A);

        assert_eq!(build_response(&valid[..11], AP_IP), None);
        assert_eq!(build_response(&valid[..valid.len() - 2], AP_IP), None);

        let mut truncated_label = valid.clone();
        truncated_label[HEADER_LEN] = 60;
        assert_eq!(build_response(&truncated_label, AP_IP), None);

        let mut response_bit = valid.clone();
        response_bit[2] |= 0x80;
        assert_eq!(build_response(&response_bit, AP_IP), None);

        let mut no_questions = valid;
        no_questions[5] = 0;
        assert_eq!(build_response(&no_questions, AP_IP), None);
    }
}
