//! RFB (Remote Framebuffer) wire protocol: constants, pixel format, and the
//! message shapes this gateway sends to, and reads from, an upstream VNC
//! server.
//!
//! All multi-byte integers on the wire are big-endian, per RFC 6143. This
//! module is pure with respect to the framebuffer: it only reads and
//! produces bytes.

use bytes::{Buf, BufMut, BytesMut};
use std::io;

/// The RFB protocol version this gateway speaks: 3.8.
pub const PROTOCOL_VERSION: &[u8] = b"RFB 003.008\n";

// Client-to-server message types.

/// Client requests to change the pixel format.
pub const CLIENT_MSG_SET_PIXEL_FORMAT: u8 = 0;
/// Client specifies supported encodings, in preference order.
pub const CLIENT_MSG_SET_ENCODINGS: u8 = 2;
/// Client requests a framebuffer update.
pub const CLIENT_MSG_FRAMEBUFFER_UPDATE_REQUEST: u8 = 3;
/// Client sends a keyboard event.
pub const CLIENT_MSG_KEY_EVENT: u8 = 4;
/// Client sends a pointer (mouse) event.
pub const CLIENT_MSG_POINTER_EVENT: u8 = 5;

// Server-to-client message types.

/// Server sends a framebuffer update (one or more rectangles).
pub const SERVER_MSG_FRAMEBUFFER_UPDATE: u8 = 0;
/// Server sets color map entries (discarded; the gateway is always true-color).
pub const SERVER_MSG_SET_COLOUR_MAP_ENTRIES: u8 = 1;
/// Server sends a bell (beep) notification.
pub const SERVER_MSG_BELL: u8 = 2;
/// Server sends cut text (clipboard data), discarded.
pub const SERVER_MSG_SERVER_CUT_TEXT: u8 = 3;

// Encodings this gateway advertises and understands. Full RFB tile-encoding
// support (RRE, Hextile, Tight, ZRLE, ...) is out of scope.

/// Raw pixel data, sent uncompressed.
pub const ENCODING_RAW: i32 = 0;
/// CopyRect: blit an existing region to a new position.
pub const ENCODING_COPYRECT: i32 = 1;
/// Pseudo-encoding: notifies the client the desktop size changed.
pub const ENCODING_DESKTOP_SIZE: i32 = -223;

/// The encodings advertised via `SetEncodings`, in preference order. Order
/// matters: the upstream is asked to prefer CopyRect where it can, but Raw
/// is the fallback this gateway always understands.
pub const ADVERTISED_ENCODINGS: [i32; 3] = [ENCODING_RAW, ENCODING_COPYRECT, ENCODING_DESKTOP_SIZE];

// Security types.

/// No authentication required.
pub const SECURITY_TYPE_NONE: u8 = 1;
/// Standard VNC DES challenge-response authentication.
pub const SECURITY_TYPE_VNC_AUTH: u8 = 2;

/// Pixel format advertised to the upstream via `SetPixelFormat`.
///
/// This gateway always requests 32 bits per pixel, depth 24, true-color,
/// little-endian-on-the-wire with R at bit-shift 16, G at 8, B at 0 — which
/// makes each pixel effectively `B, G, R, X` in byte order. The Raw
/// rectangle decoder relies on exactly this layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelFormat {
    /// Bits per pixel (always 32 for this gateway).
    pub bits_per_pixel: u8,
    /// Color depth in bits (always 24).
    pub depth: u8,
    /// 1 if the upstream should treat multi-byte pixels as big-endian.
    pub big_endian_flag: u8,
    /// 1 for true-color (always set).
    pub true_colour_flag: u8,
    /// Maximum red component value.
    pub red_max: u16,
    /// Maximum green component value.
    pub green_max: u16,
    /// Maximum blue component value.
    pub blue_max: u16,
    /// Bit shift to the red component.
    pub red_shift: u8,
    /// Bit shift to the green component.
    pub green_shift: u8,
    /// Bit shift to the blue component.
    pub blue_shift: u8,
}

impl PixelFormat {
    /// The fixed format this gateway negotiates with every upstream.
    #[must_use]
    pub const fn gateway_format() -> Self {
        Self {
            bits_per_pixel: 32,
            depth: 24,
            big_endian_flag: 0,
            true_colour_flag: 1,
            red_max: 255,
            green_max: 255,
            blue_max: 255,
            red_shift: 16,
            green_shift: 8,
            blue_shift: 0,
        }
    }

    /// Serializes the pixel format to its 16-byte wire representation.
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u8(self.bits_per_pixel);
        buf.put_u8(self.depth);
        buf.put_u8(self.big_endian_flag);
        buf.put_u8(self.true_colour_flag);
        buf.put_u16(self.red_max);
        buf.put_u16(self.green_max);
        buf.put_u16(self.blue_max);
        buf.put_u8(self.red_shift);
        buf.put_u8(self.green_shift);
        buf.put_u8(self.blue_shift);
        buf.put_bytes(0, 3); // padding
    }

    /// Parses a 16-byte pixel format off the wire. `buf` must contain at
    /// least 16 bytes; the padding bytes are consumed but not validated.
    pub fn from_bytes(buf: &mut BytesMut) -> io::Result<Self> {
        if buf.len() < 16 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "not enough bytes for PixelFormat",
            ));
        }
        let pf = Self {
            bits_per_pixel: buf.get_u8(),
            depth: buf.get_u8(),
            big_endian_flag: buf.get_u8(),
            true_colour_flag: buf.get_u8(),
            red_max: buf.get_u16(),
            green_max: buf.get_u16(),
            blue_max: buf.get_u16(),
            red_shift: buf.get_u8(),
            green_shift: buf.get_u8(),
            blue_shift: buf.get_u8(),
        };
        buf.advance(3);
        Ok(pf)
    }
}

/// `ServerInit`, read once at the end of the handshake.
#[derive(Debug, Clone)]
pub struct ServerInit {
    /// Upstream framebuffer width in pixels.
    pub framebuffer_width: u16,
    /// Upstream framebuffer height in pixels.
    pub framebuffer_height: u16,
    /// The upstream's own pixel format (discarded; we override it).
    pub pixel_format: PixelFormat,
    /// The upstream's desktop name (discarded).
    pub name: String,
}

/// Header of one rectangle inside a `FramebufferUpdate` message.
#[derive(Debug, Clone, Copy)]
pub struct RectHeader {
    /// X coordinate of the top-left corner.
    pub x: u16,
    /// Y coordinate of the top-left corner.
    pub y: u16,
    /// Width in pixels.
    pub width: u16,
    /// Height in pixels.
    pub height: u16,
    /// Encoding type, signed per RFC 6143 (pseudo-encodings are negative).
    pub encoding: i32,
}

/// Builds the outbound `SetPixelFormat` message (20 bytes: 1 type + 3 pad +
/// 16-byte pixel format).
pub fn encode_set_pixel_format(format: &PixelFormat) -> BytesMut {
    let mut buf = BytesMut::with_capacity(20);
    buf.put_u8(CLIENT_MSG_SET_PIXEL_FORMAT);
    buf.put_bytes(0, 3);
    format.write_to(&mut buf);
    buf
}

/// Builds the outbound `SetEncodings` message advertising
/// [`ADVERTISED_ENCODINGS`] in order.
pub fn encode_set_encodings() -> BytesMut {
    let encodings = ADVERTISED_ENCODINGS;
    let mut buf = BytesMut::with_capacity(4 + encodings.len() * 4);
    buf.put_u8(CLIENT_MSG_SET_ENCODINGS);
    buf.put_u8(0); // padding
    buf.put_u16(encodings.len() as u16);
    for encoding in encodings {
        buf.put_i32(encoding);
    }
    buf
}

/// Builds an outbound `FramebufferUpdateRequest` covering `(x, y, width,
/// height)`.
pub fn encode_framebuffer_update_request(
    incremental: bool,
    x: u16,
    y: u16,
    width: u16,
    height: u16,
) -> BytesMut {
    let mut buf = BytesMut::with_capacity(10);
    buf.put_u8(CLIENT_MSG_FRAMEBUFFER_UPDATE_REQUEST);
    buf.put_u8(u8::from(incremental));
    buf.put_u16(x);
    buf.put_u16(y);
    buf.put_u16(width);
    buf.put_u16(height);
    buf
}

/// Builds an outbound `KeyEvent` message.
pub fn encode_key_event(down: bool, keysym: u32) -> BytesMut {
    let mut buf = BytesMut::with_capacity(8);
    buf.put_u8(CLIENT_MSG_KEY_EVENT);
    buf.put_u8(u8::from(down));
    buf.put_bytes(0, 2);
    buf.put_u32(keysym);
    buf
}

/// Builds an outbound `PointerEvent` message.
pub fn encode_pointer_event(button_mask: u8, x: u16, y: u16) -> BytesMut {
    let mut buf = BytesMut::with_capacity(6);
    buf.put_u8(CLIENT_MSG_POINTER_EVENT);
    buf.put_u8(button_mask);
    buf.put_u16(x);
    buf.put_u16(y);
    buf
}

/// Converts one Raw-encoded rectangle's wire bytes (little-endian BGRX, 4
/// bytes per pixel) into row-major RGB triples.
///
/// # Panics
///
/// Panics if `data.len() != width * height * 4`; callers read exactly that
/// many bytes off the socket before calling this.
#[must_use]
pub fn bgrx_to_rgb(data: &[u8], width: u16, height: u16) -> Vec<u8> {
    let pixel_count = usize::from(width) * usize::from(height);
    assert_eq!(data.len(), pixel_count * 4, "Raw rectangle pixel buffer size mismatch");
    let mut out = Vec::with_capacity(pixel_count * 3);
    for chunk in data.chunks_exact(4) {
        // Wire byte order is B, G, R, X (pixel = R | G<<8 | B<<16, little-endian).
        out.push(chunk[2]); // R
        out.push(chunk[1]); // G
        out.push(chunk[0]); // B
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pixel_format_round_trips() {
        let format = PixelFormat::gateway_format();
        let mut buf = BytesMut::new();
        format.write_to(&mut buf);
        assert_eq!(buf.len(), 16);
        let decoded = PixelFormat::from_bytes(&mut buf).unwrap();
        assert_eq!(decoded, format);
    }

    #[test]
    fn set_pixel_format_is_20_bytes() {
        let buf = encode_set_pixel_format(&PixelFormat::gateway_format());
        assert_eq!(buf.len(), 20);
        assert_eq!(buf[0], CLIENT_MSG_SET_PIXEL_FORMAT);
    }

    #[test]
    fn set_encodings_is_12_bytes_for_three_encodings() {
        let buf = encode_set_encodings();
        assert_eq!(buf.len(), 4 + 3 * 4);
        assert_eq!(buf[0], CLIENT_MSG_SET_ENCODINGS);
    }

    #[test]
    fn initial_update_request_matches_spec_example() {
        // From SPEC_FULL.md scenario 1: 1600x900, non-incremental, full screen.
        let buf = encode_framebuffer_update_request(false, 0, 0, 1600, 900);
        let expected = [0x03u8, 0x00, 0x00, 0x00, 0x00, 0x00, 0x06, 0x40, 0x03, 0x84];
        assert_eq!(&buf[..], &expected[..]);
    }

    #[test]
    fn click_pointer_events_match_spec_example() {
        let down = encode_pointer_event(1, 100, 200);
        assert_eq!(&down[..], &[0x05, 0x01, 0x00, 0x64, 0x00, 0xC8]);
        let up = encode_pointer_event(0, 100, 200);
        assert_eq!(&up[..], &[0x05, 0x00, 0x00, 0x64, 0x00, 0xC8]);
    }

    #[test]
    fn bgrx_round_trips_rgb_losslessly() {
        // Two pixels: (0x22,0x33,0x44) and (0x55,0x66,0x77), per SPEC_FULL.md scenario 2.
        let wire = [0x44, 0x33, 0x22, 0xFF, 0x77, 0x66, 0x55, 0xFF];
        let rgb = bgrx_to_rgb(&wire, 2, 1);
        assert_eq!(rgb, vec![0x22, 0x33, 0x44, 0x55, 0x66, 0x77]);
    }
}
