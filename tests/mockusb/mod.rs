#![allow(dead_code)]

use std::{cell::RefCell, cmp::min, rc::Rc};

use usb_device::bus::PollResult;
use usb_device::bus::UsbBusAllocator;
use usb_device::endpoint::{EndpointAddress, EndpointType};
use usb_device::prelude::*;
use usb_device::{Result, UsbDirection};

use usbd_relay_boot::HidBootClass;

#[derive(Debug, PartialEq, Eq)]
pub enum EPErr {
    Stalled,
}

const EP_COUNT: usize = 4;
pub const EP0_SIZE: u8 = 8;

struct EP {
    alloc: bool,
    stall: bool,
    read_len: usize,
    read: [u8; 1024],
    read_ready: bool,
    write_len: usize,
    write: [u8; 1024],
    write_done: bool,
    setup: bool,
    max_size: usize,
}
impl EP {
    fn new() -> Self {
        EP {
            alloc: false,
            stall: false,
            read_len: 0,
            read: [0; 1024],
            read_ready: false,
            write_len: 0,
            write: [0; 1024],
            write_done: false,
            setup: false,
            max_size: 0,
        }
    }

    fn set_read(&mut self, data: &[u8], setup: bool) {
        self.read_len = data.len();
        self.read[..data.len()].copy_from_slice(data);
        self.setup = setup;
        self.read_ready = true;
    }

    fn get_write(&mut self, data: &mut [u8]) -> usize {
        let res = self.write_len;
        self.write_len = 0;
        data[..res].clone_from_slice(&self.write[..res]);
        self.write_done = true;
        res
    }
}

struct TestBusIO {
    ep_i: [RefCell<EP>; EP_COUNT],
    ep_o: [RefCell<EP>; EP_COUNT],
}

unsafe impl Sync for TestBusIO {}

impl TestBusIO {
    fn new() -> Self {
        Self {
            ep_i: std::array::from_fn(|_| RefCell::new(EP::new())),
            ep_o: std::array::from_fn(|_| RefCell::new(EP::new())),
        }
    }

    fn epidx(&self, ep_addr: EndpointAddress) -> &RefCell<EP> {
        match ep_addr.direction() {
            UsbDirection::In => self.ep_i.get(ep_addr.index()).unwrap(),
            UsbDirection::Out => self.ep_o.get(ep_addr.index()).unwrap(),
        }
    }

    fn get_write(&self, ep_addr: EndpointAddress, data: &mut [u8]) -> usize {
        let mut ep = self.epidx(ep_addr).borrow_mut();
        ep.get_write(data)
    }

    fn set_read(&self, ep_addr: EndpointAddress, data: &[u8], setup: bool) {
        let mut ep = self.epidx(ep_addr).borrow_mut();
        if setup && ep_addr.index() == 0 && ep_addr.direction() == UsbDirection::Out {
            // setup packet on EP0OUT removes stall condition
            ep.stall = false;
            let mut ep0in = self.ep_i.get(0).unwrap().borrow_mut();
            ep0in.stall = false;
        }
        ep.set_read(data, setup)
    }

    fn pending_read(&self, ep_addr: EndpointAddress) -> bool {
        self.epidx(ep_addr).borrow().read_ready
    }

    fn stalled0(&self) -> bool {
        let in0 = EndpointAddress::from_parts(0, UsbDirection::In);
        let out0 = EndpointAddress::from_parts(0, UsbDirection::Out);
        self.epidx(in0).borrow().stall || self.epidx(out0).borrow().stall
    }
}

pub struct TestBus {
    rrio: Rc<RefCell<TestBusIO>>,
}

unsafe impl Sync for TestBus {}

impl TestBus {
    fn new(rrio: &Rc<RefCell<TestBusIO>>) -> Self {
        Self { rrio: rrio.clone() }
    }
    fn io(&self) -> &RefCell<TestBusIO> {
        self.rrio.as_ref()
    }
}

impl usb_device::bus::UsbBus for TestBus {
    fn alloc_ep(
        &mut self,
        ep_dir: UsbDirection,
        ep_addr: Option<EndpointAddress>,
        _ep_type: EndpointType,
        max_packet_size: u16,
        _interval: u8,
    ) -> Result<EndpointAddress> {
        let io = self.io().borrow();

        let ea = match ep_addr {
            Some(ea) => ea,
            None => {
                // first free non-control endpoint
                let index = (1..EP_COUNT)
                    .find(|i| {
                        let ea = EndpointAddress::from_parts(*i, ep_dir);
                        !io.epidx(ea).borrow().alloc
                    })
                    .ok_or(UsbError::EndpointOverflow)?;
                EndpointAddress::from_parts(index, ep_dir)
            }
        };

        let mut sep = io.epidx(ea).borrow_mut();
        assert!(!sep.alloc);
        sep.alloc = true;
        sep.stall = false;
        sep.max_size = max_packet_size as usize;

        Ok(ea)
    }
    fn enable(&mut self) {}
    fn force_reset(&self) -> Result<()> {
        Ok(())
    }
    fn poll(&self) -> PollResult {
        let io = self.io().borrow();

        let mut ep_in_complete = 0u16;
        let mut ep_out = 0u16;
        let mut ep_setup = 0u16;

        for i in 0..EP_COUNT {
            let out = io.ep_o[i].borrow();
            let mut inp = io.ep_i[i].borrow_mut();

            if inp.write_done {
                ep_in_complete |= 1 << i;
                inp.write_done = false;
            }
            if out.read_ready || (i == 0 && inp.read_ready) {
                ep_out |= 1 << i;
            }
            if out.setup {
                ep_setup |= 1 << i;
            }
        }

        if ep_in_complete | ep_out | ep_setup != 0 {
            PollResult::Data {
                ep_in_complete,
                ep_out,
                ep_setup,
            }
        } else {
            PollResult::None
        }
    }
    fn read(&self, ep_addr: EndpointAddress, buf: &mut [u8]) -> Result<usize> {
        let io = self.io().borrow();
        let mut ep = io.epidx(ep_addr).borrow_mut();
        let len = min(buf.len(), min(ep.read_len, ep.max_size));

        if len == 0 {
            return Err(UsbError::WouldBlock);
        }

        buf[..len].clone_from_slice(&ep.read[..len]);

        ep.read_len -= len;
        ep.read.copy_within(len.., 0);

        if ep.read_len == 0 {
            ep.setup = false;
        }

        ep.read_ready = ep.read_len > 0;

        Ok(len)
    }
    fn reset(&self) {}
    fn resume(&self) {}
    fn suspend(&self) {}
    fn set_device_address(&self, addr: u8) {
        assert_eq!(addr, 5);
    }
    fn is_stalled(&self, ep_addr: EndpointAddress) -> bool {
        let io = self.io().borrow();
        let ep = io.epidx(ep_addr).borrow();
        ep.stall
    }
    fn set_stalled(&self, ep_addr: EndpointAddress, stalled: bool) {
        let io = self.io().borrow();
        let mut ep = io.epidx(ep_addr).borrow_mut();
        ep.stall = stalled;
    }
    fn write(&self, ep_addr: EndpointAddress, buf: &[u8]) -> Result<usize> {
        let io = self.io().borrow();
        let mut ep = io.epidx(ep_addr).borrow_mut();
        let offset = ep.write_len;

        if buf.len() > ep.max_size {
            return Err(UsbError::BufferOverflow);
        }
        if ep_addr.index() != 0 && offset != 0 {
            // previous report not collected by the host yet
            return Err(UsbError::WouldBlock);
        }

        ep.write[offset..offset + buf.len()].copy_from_slice(buf);
        ep.write_len += buf.len();
        ep.write_done = false;
        Ok(buf.len())
    }
}

pub fn ep_in(index: usize) -> EndpointAddress {
    EndpointAddress::from_parts(index, UsbDirection::In)
}

pub fn ep_out(index: usize) -> EndpointAddress {
    EndpointAddress::from_parts(index, UsbDirection::Out)
}

/// Host side of the test bus.
pub struct Harness<'a> {
    io: Rc<RefCell<TestBusIO>>,
    dev: UsbDevice<'a, TestBus>,
}

impl<'a> Harness<'a> {
    pub fn poll(&mut self, cls: &mut HidBootClass<'a, TestBus>) -> bool {
        self.dev.poll(&mut [&mut *cls])
    }

    pub fn state(&self) -> UsbDeviceState {
        self.dev.state()
    }

    /// Run one control transfer.
    pub fn transact(
        &mut self,
        cls: &mut HidBootClass<'a, TestBus>,
        setup: &[u8],
        data: Option<&[u8]>,
        out: &mut [u8],
    ) -> core::result::Result<usize, EPErr> {
        let out0 = ep_out(0);
        let in0 = ep_in(0);

        self.io.borrow().set_read(out0, setup, true);
        self.poll(cls);
        if self.io.borrow().stalled0() {
            return Err(EPErr::Stalled);
        }

        if let Some(val) = data {
            self.io.borrow().set_read(out0, val, false);
            for i in 1..100 {
                if !self.poll(cls) {
                    break;
                }
                if i >= 99 {
                    panic!("read too much");
                }
            }
            if self.io.borrow().stalled0() {
                return Err(EPErr::Stalled);
            }
        };

        let mut len = 0;

        loop {
            let one = self.io.borrow().get_write(in0, &mut out[len..]);
            self.poll(cls);
            if self.io.borrow().stalled0() {
                return Err(EPErr::Stalled);
            }

            len += one;
            if one < EP0_SIZE as usize {
                // short read - last block
                break;
            }
        }

        Ok(len)
    }

    /// Host sends an output report.
    pub fn write_report(&mut self, cls: &mut HidBootClass<'a, TestBus>, ep: usize, data: &[u8]) {
        self.io.borrow().set_read(ep_out(ep), data, false);
        self.poll(cls);
    }

    /// `true` while the device has not read the last output report.
    pub fn report_pending(&self, ep: usize) -> bool {
        self.io.borrow().pending_read(ep_out(ep))
    }

    /// Host collects an input report. Returns its length, `0` if none.
    pub fn read_report(
        &mut self,
        cls: &mut HidBootClass<'a, TestBus>,
        ep: usize,
        out: &mut [u8],
    ) -> usize {
        let len = self.io.borrow().get_write(ep_in(ep), out);
        self.poll(cls);
        len
    }
}

pub fn with_usb<F>(case: F)
where
    F: for<'a> FnOnce(&mut HidBootClass<'a, TestBus>, &mut Harness<'a>),
{
    let io = Rc::new(RefCell::new(TestBusIO::new()));
    let bus = TestBus::new(&io);

    let alloc: UsbBusAllocator<TestBus> = UsbBusAllocator::new(bus);

    let mut cls = HidBootClass::new(&alloc);

    let dev = UsbDeviceBuilder::new(&alloc, UsbVidPid(0x04d8, 0xe89b)).build();

    let mut harness = Harness { io, dev };
    harness.poll(&mut cls);

    // basic usb device setup
    {
        let mut buf = [0; 8];
        let mut len;

        // set address
        len = harness
            .transact(&mut cls, &[0, 0x5, 5, 0, 0, 0, 0, 0], None, &mut buf)
            .expect("len");
        assert_eq!(len, 0);

        // set configuration
        len = harness
            .transact(&mut cls, &[0, 0x9, 1, 0, 0, 0, 0, 0], None, &mut buf)
            .expect("len");
        assert_eq!(len, 0);
    }

    // run test
    case(&mut cls, &mut harness);
}
