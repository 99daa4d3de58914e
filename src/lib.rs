// Copyright 2025 Dustin McAfee
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! # rfbgateway
//!
//! A remote-desktop gateway: terminates the RFB (VNC) protocol against one
//! or more upstream display servers, keeps an authoritative framebuffer per
//! upstream, and multiplexes live views and input events to many
//! browser-style subscribers over a JSON duplex channel, plus a REST surface
//! for scripted automation.
//!
//! ## Architecture
//!
//! ```text
//! upstream VNC server
//!        │  RFB 3.8 / TCP
//!        ▼
//!   RfbSession  ──applies rects──▶  Framebuffer ──dirty signal──▶ Broadcaster
//!        ▲                                                            │
//!        │ PointerEvent/KeyEvent                                      │ JPEG delta
//!   InputSurface                                                      ▼
//!        ▲                                                     SubscriberSink
//!        │                                                            ▲
//!   SessionRegistry ◀──────────────── gateway binary (axum) ──────────┘
//! ```
//!
//! This crate is the core: the RFB protocol engine, the shared framebuffer,
//! the session registry, the broadcaster, and the input surface. It has no
//! HTTP/WebSocket dependency; [`subscriber::SubscriberSink`] is a trait so
//! the gateway binary (`src/bin/gateway.rs`) can adapt an `axum` WebSocket
//! without the core knowing about `axum` at all.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod broadcaster;
pub mod compression;
pub mod error;
pub mod framebuffer;
pub mod input;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod subscriber;

pub use broadcaster::Broadcaster;
pub use error::{GatewayError, Result};
pub use framebuffer::{Framebuffer, Rect};
pub use input::InputSurface;
pub use protocol::PixelFormat;
pub use registry::SessionRegistry;
pub use session::RfbSession;
pub use subscriber::{InboundMessage, OutboundMessage, SinkError, SubscriberSink};

/// RFB protocol version this gateway speaks.
pub const PROTOCOL_VERSION: &str = "RFB 003.008\n";

/// Default VNC port, used when a REST/WebSocket route omits one.
pub const DEFAULT_PORT: u16 = 5900;
