use usb_device::class_prelude::*;
use usb_device::control::{Recipient, Request, RequestType};

use crate::packet::{Packet, PACKET_SIZE};
use crate::server::HostPort;

const USB_CLASS_HID: u8 = 0x03;
const USB_SUBCLASS_NONE: u8 = 0x00;
const USB_PROTOCOL_NONE: u8 = 0x00;

const DESC_DESCTYPE_HID: u8 = 0x21;
const DESC_DESCTYPE_REPORT: u8 = 0x22;

const HID_SET_IDLE: u8 = 0x0A;

/// Polling interval of the interrupt endpoints, in frames.
const EP_INTERVAL: u8 = 1;

/// Vendor defined report descriptor: one 64-byte input report and one
/// 64-byte output report.
pub const REPORT_DESCRIPTOR: &[u8] = &[
    0x06, 0x00, 0xFF, // Usage Page (Vendor Defined 0xFF00)
    0x09, 0x01, // Usage (Vendor Usage 1)
    0xA1, 0x01, // Collection (Application)
    0x19, 0x01, //   Usage Minimum (1)
    0x29, 0x40, //   Usage Maximum (64)
    0x15, 0x00, //   Logical Minimum (0)
    0x26, 0xFF, 0x00, //   Logical Maximum (255)
    0x75, 0x08, //   Report Size (8)
    0x95, 0x40, //   Report Count (64)
    0x81, 0x00, //   Input (Data, Array, Abs)
    0x19, 0x01, //   Usage Minimum (1)
    0x29, 0x40, //   Usage Maximum (64)
    0x91, 0x00, //   Output (Data, Array, Abs)
    0xC0, // End Collection
];

/// USB HID class carrying bootloader command packets.
///
/// Command packets arrive as output reports on an interrupt OUT endpoint,
/// responses leave as input reports on an interrupt IN endpoint. The OUT
/// endpoint is only read when the bootloader asks for the next command,
/// so the host is NAKed while a command is in progress.
pub struct HidBootClass<'a, B: UsbBus> {
    if_num: InterfaceNumber,
    ep_in: EndpointIn<'a, B>,
    ep_out: EndpointOut<'a, B>,
    idle_rate: u8,
}

impl<'a, B: UsbBus> HidBootClass<'a, B> {
    /// Allocates the interface and both endpoints.
    pub fn new(alloc: &'a UsbBusAllocator<B>) -> Self {
        Self {
            if_num: alloc.interface(),
            ep_in: alloc.interrupt(PACKET_SIZE as u16, EP_INTERVAL),
            ep_out: alloc.interrupt(PACKET_SIZE as u16, EP_INTERVAL),
            idle_rate: 0,
        }
    }

    /// Idle rate last set by the host.
    pub fn idle_rate(&self) -> u8 {
        self.idle_rate
    }

    fn hid_descriptor(&self) -> [u8; 7] {
        let len = REPORT_DESCRIPTOR.len() as u16;
        [
            // bcdHID 1.11
            0x11,
            0x01,
            // bCountryCode
            0x00,
            // bNumDescriptors
            0x01,
            // bDescriptorType
            DESC_DESCTYPE_REPORT,
            // wDescriptorLength
            (len & 0xff) as u8,
            (len >> 8) as u8,
        ]
    }

    fn for_us(&self, req: &Request) -> bool {
        req.recipient == Recipient::Interface && req.index == u8::from(self.if_num) as u16
    }
}

impl<B: UsbBus> HostPort for HidBootClass<'_, B> {
    fn receive(&mut self, packet: &mut Packet) -> bool {
        matches!(self.ep_out.read(packet), Ok(PACKET_SIZE))
    }

    fn transmit(&mut self, packet: &Packet) -> bool {
        self.ep_in.write(packet).is_ok()
    }
}

impl<B: UsbBus> UsbClass<B> for HidBootClass<'_, B> {
    fn get_configuration_descriptors(
        &self,
        writer: &mut DescriptorWriter,
    ) -> usb_device::Result<()> {
        writer.interface(
            self.if_num,
            USB_CLASS_HID,
            USB_SUBCLASS_NONE,
            USB_PROTOCOL_NONE,
        )?;

        writer.write(DESC_DESCTYPE_HID, &self.hid_descriptor())?;

        writer.endpoint(&self.ep_in)?;
        writer.endpoint(&self.ep_out)?;

        Ok(())
    }

    // Handle control requests to the host.
    fn control_in(&mut self, xfer: ControlIn<B>) {
        let req = *xfer.request();

        if !self.for_us(&req) {
            return;
        }

        match (req.request_type, req.request) {
            (RequestType::Standard, Request::GET_DESCRIPTOR) => {
                let (desc_type, _) = req.descriptor_type_index();
                match desc_type {
                    DESC_DESCTYPE_REPORT => {
                        xfer.accept_with_static(REPORT_DESCRIPTOR).ok();
                    }
                    DESC_DESCTYPE_HID => {
                        let mut buf = [0u8; 9];
                        buf[0] = buf.len() as u8;
                        buf[1] = DESC_DESCTYPE_HID;
                        buf[2..].copy_from_slice(&self.hid_descriptor());
                        xfer.accept_with(&buf).ok();
                    }
                    _ => {}
                }
            }
            (RequestType::Class, _) => {
                // GET_REPORT included: reports only travel on the interrupt endpoints
                xfer.reject().ok();
            }
            _ => {}
        }
    }

    // Handle a control request from the host.
    fn control_out(&mut self, xfer: ControlOut<B>) {
        let req = *xfer.request();

        if req.request_type != RequestType::Class || !self.for_us(&req) {
            return;
        }

        match req.request {
            HID_SET_IDLE => {
                self.idle_rate = (req.value >> 8) as u8;
                xfer.accept().ok();
            }
            _ => {
                xfer.reject().ok();
            }
        }
    }

    fn reset(&mut self) {
        self.idle_rate = 0;
    }
}
