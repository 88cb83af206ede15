use tonic::Code;

const LEADER_MARKER: &str = "leader_addr=";

/// Leader address embedded in a follower's rejection.
///
/// Only failed-precondition statuses carry the hint. The address runs from
/// the first `leader_addr=` to the next whitespace, with trailing `)`, `,`
/// and `;` removed.
pub fn leader_addr_from_status(status: &tonic::Status) -> Option<String> {
    if status.code() != Code::FailedPrecondition {
        return None;
    }
    let message = status.message();
    let start = message.find(LEADER_MARKER)? + LEADER_MARKER.len();
    let addr = message[start..]
        .split_whitespace()
        .next()?
        .trim_end_matches([')', ',', ';']);
    (!addr.is_empty()).then(|| addr.to_string())
}
