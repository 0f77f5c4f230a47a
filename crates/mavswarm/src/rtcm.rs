use mavlink::ardupilotmega::GPS_RTCM_DATA_DATA;

/// Payload capacity of a single GPS_RTCM_DATA message.
pub const FRAGMENT_LEN: usize = 180;

/// Largest RTCM frame that fits the four-fragment window.
pub const MAX_FRAME_LEN: usize = FRAGMENT_LEN * 4;

/// Split one RTCM frame into GPS_RTCM_DATA messages.
///
/// The flags byte is `fragmented | fragment_index << 1 | sequence << 3` with a
/// 5-bit sequence. Frames up to 180 bytes go out unfragmented; frames up to
/// 720 bytes are cut into up to four fragments, where a fragment shorter than
/// 180 bytes terminates the set (an exact multiple of 180 is terminated by the
/// next sequence starting). Anything longer is dropped.
pub fn fragment(seq: u8, frame: &[u8]) -> Vec<GPS_RTCM_DATA_DATA> {
    let seq_bits = (seq & 0x1f) << 3;

    if frame.len() <= FRAGMENT_LEN {
        let mut msg = GPS_RTCM_DATA_DATA {
            flags: seq_bits,
            len: frame.len() as u8,
            ..Default::default()
        };
        msg.data[..frame.len()].copy_from_slice(frame);
        return vec![msg];
    }

    if frame.len() > MAX_FRAME_LEN {
        return Vec::new();
    }

    frame
        .chunks(FRAGMENT_LEN)
        .enumerate()
        .map(|(index, chunk)| {
            let mut msg = GPS_RTCM_DATA_DATA {
                flags: 0x01 | ((index as u8) << 1) | seq_bits,
                len: chunk.len() as u8,
                ..Default::default()
            };
            msg.data[..chunk.len()].copy_from_slice(chunk);
            msg
        })
        .collect()
}
