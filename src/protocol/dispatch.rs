use std::cell::RefCell;
use std::rc::Rc;

use mumble_protocol_2x::control::ControlPacket;
use mumble_protocol_2x::voice::{Clientbound, VoicePacket};

/// Receives every decoded control packet. Returning an error skips the
/// handler for that packet only; delivery to the others continues.
pub trait ControlHandler {
    fn handle_control(&mut self, packet: &ControlPacket<Clientbound>) -> Result<(), String>;
}

/// Receives every decoded voice datagram, whether it arrived over the
/// datagram channel or tunneled through the control stream.
pub trait DatagramHandler {
    fn handle_datagram(&mut self, packet: &VoicePacket<Clientbound>) -> Result<(), String>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HandlerToken(u64);

/// Fans inbound packets out to registered handlers, in registration order,
/// on the caller's context. Handlers are isolated from each other: one
/// failing never suppresses delivery to the rest.
#[derive(Default)]
pub struct MessageDispatcher {
    control: Vec<(HandlerToken, Rc<RefCell<dyn ControlHandler>>)>,
    datagram: Vec<(HandlerToken, Rc<RefCell<dyn DatagramHandler>>)>,
    next_token: u64,
}

impl MessageDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_control(&mut self, handler: Rc<RefCell<dyn ControlHandler>>) -> HandlerToken {
        let token = self.mint_token();
        self.control.push((token, handler));
        token
    }

    pub fn register_datagram(&mut self, handler: Rc<RefCell<dyn DatagramHandler>>) -> HandlerToken {
        let token = self.mint_token();
        self.datagram.push((token, handler));
        token
    }

    /// Unknown tokens are a no-op, so double unregistration is harmless.
    pub fn unregister(&mut self, token: HandlerToken) {
        self.control.retain(|(held, _)| *held != token);
        self.datagram.retain(|(held, _)| *held != token);
    }

    pub fn dispatch_control(&mut self, packet: &ControlPacket<Clientbound>) {
        for (token, handler) in &self.control {
            if let Err(cause) = handler.borrow_mut().handle_control(packet) {
                log::warn!("control handler {:?} failed: {cause}", token);
            }
        }
    }

    pub fn dispatch_datagram(&mut self, packet: &VoicePacket<Clientbound>) {
        for (token, handler) in &self.datagram {
            if let Err(cause) = handler.borrow_mut().handle_datagram(packet) {
                log::warn!("datagram handler {:?} failed: {cause}", token);
            }
        }
    }

    fn mint_token(&mut self) -> HandlerToken {
        let token = HandlerToken(self.next_token);
        self.next_token += 1;
        token
    }
}
