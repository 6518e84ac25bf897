//! scripted in-memory bus, standing for a ring of slaves behind a transport

#![allow(dead_code)]

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
    };
use ethercycle::{
    EthercatError, EthercatResult,
    registers::{AlControlRequest, AlState, AlStatus},
    transport::{BusTransport, DiscoveredSlave, ImageMap, Receive, Region, SlaveAddress, SlaveRegions},
    };


pub const INIT: u8 = 0x01;
pub const PREOP: u8 = 0x02;
pub const SAFEOP: u8 = 0x04;
pub const OP: u8 = 0x08;
pub const ERROR: u8 = 0x10;

/// install the logger once for all tests
pub fn logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// a slave as the simulated bus sees it
#[derive(Clone, Debug, Default)]
pub struct SimSlave {
    pub alias: u16,
    pub vendor: u32,
    pub product: u32,
    pub input_bits: usize,
    pub output_bits: usize,

    /// AL status register
    pub state: u8,
    pub code: u16,
    /// answers to any access
    pub present: bool,
    /// refuses to go to OP, falling in SAFE_OP+ERR
    pub refuse_op: usize,
    /// DC system time difference
    pub dc_offset: i32,
    pub sync0: bool,
    pub watchdog: Option<u16>,
    pub rx_errors: u8,

    /// process data sent to the master
    pub inputs: Vec<u8>,
    /// process data last received from the master
    pub outputs: Vec<u8>,
    /// object dictionary
    pub dictionary: HashMap<(u16, u8), Vec<u8>>,
}
impl SimSlave {
    pub fn new(alias: u16, vendor: u32, product: u32, input_bits: usize, output_bits: usize) -> Self {
        Self {
            alias, vendor, product, input_bits, output_bits,
            state: INIT,
            present: true,
            inputs: vec![0; (input_bits + 7) / 8],
            outputs: vec![0; (output_bits + 7) / 8],
            ..Default::default()
        }
    }
    fn request(&mut self, request: u8) {
        let state = request & 0x0f;
        let ack = request & 0x10 != 0;
        if self.state & ERROR != 0 {
            if ack {
                self.state = state;
                self.code = 0;
            }
        }
        else if state == OP && self.refuse_op > 0 {
            self.refuse_op -= 1;
            self.state = SAFEOP | ERROR;
            self.code = 0x1b;
        }
        else {
            self.state = state;
        }
    }
}

/// everything the simulated bus holds, accessed by the tests through [SimBus::lock]
#[derive(Debug, Default)]
pub struct SimState {
    pub slaves: Vec<SimSlave>,
    pub opened: Option<String>,
    pub closed: bool,
    pub dc_capable: bool,
    /// nanoseconds added to the DC time at each frame
    pub cycle: i64,
    /// added to the cycle on every other frame
    pub jitter: i64,
    pub dc_time: i64,
    pub frames: u64,
    pub drop_frames: bool,
    /// extra bytes allocated by the process image mapping
    pub oversize: usize,
    pub stay_preop: bool,
    pub layout: Vec<SlaveRegions>,
    pub image: Vec<u8>,
    pub sdo_reads: Vec<(u16, u16, u8)>,
    pub sdo_writes: Vec<(u16, u16, u8, Vec<u8>)>,
    pub broadcasts: Vec<u8>,
    pub complete_access: Vec<u16>,
}

pub struct SimBus {
    state: Mutex<SimState>,
}
impl SimBus {
    pub fn new(slaves: Vec<SimSlave>) -> Arc<Self> {
        Arc::new(Self {state: Mutex::new(SimState {
            slaves,
            dc_capable: true,
            cycle: 1_000_000,
            dc_time: 1_000_000_000,
            ..Default::default()
        })})
    }
    pub fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap()
    }
    fn slave<R>(&self, index: u16, access: impl FnOnce(&mut SimSlave) -> R) -> Option<R> {
        let mut state = self.lock();
        state.slaves.get_mut(usize::from(index))
            .filter(|slave| slave.present)
            .map(access)
    }
}

impl BusTransport for SimBus {
    fn open(&self, interface: &str) -> EthercatResult {
        if interface == "missing"
            {return Err(EthercatError::Master("no such interface"))}
        self.lock().opened = Some(interface.into());
        Ok(())
    }
    fn close(&self) {
        self.lock().closed = true;
    }
    fn enumerate(&self) -> EthercatResult<Vec<DiscoveredSlave>> {
        let mut state = self.lock();
        Ok(state.slaves.iter_mut()
            .filter(|slave| slave.present)
            .map(|slave| {
                slave.state = PREOP;
                DiscoveredSlave {
                    alias: slave.alias,
                    vendor: slave.vendor,
                    product: slave.product,
                    input_bits: slave.input_bits,
                    output_bits: slave.output_bits,
                }
            })
            .collect())
    }
    fn configure_dc(&self) -> bool {
        self.lock().dc_capable
    }
    fn map_process_image(&self, _size: usize) -> EthercatResult<ImageMap> {
        let mut state = self.lock();
        let mut layout = Vec::new();
        let outputs = state.slaves.iter().map(|slave| (slave.output_bits + 7) / 8).sum::<usize>();
        let (mut output, mut input) = (0, outputs);
        for slave in state.slaves.iter() {
            layout.push(SlaveRegions {
                outputs: Region {byte: output, bit: 0, bits: slave.output_bits},
                inputs: Region {byte: input, bit: 0, bits: slave.input_bits},
                });
            output += (slave.output_bits + 7) / 8;
            input += (slave.input_bits + 7) / 8;
        }
        let stay = state.stay_preop;
        for slave in state.slaves.iter_mut() {
            if ! stay
                {slave.state = SAFEOP}
        }
        let map = ImageMap {
            size: input + state.oversize,
            slaves: layout.clone(),
            outputs_wkc: state.slaves.iter().filter(|s| s.output_bits != 0).count() as u16,
            inputs_wkc: state.slaves.iter().filter(|s| s.input_bits != 0).count() as u16,
            };
        state.layout = layout;
        Ok(map)
    }

    fn send(&self, image: &[u8]) -> EthercatResult {
        self.lock().image = image.to_vec();
        Ok(())
    }
    fn receive(&self, image: &mut [u8], _timeout: Duration) -> Receive {
        let mut state = self.lock();
        if state.drop_frames
            {return Receive::NoFrame}
        state.frames += 1;
        let deviation = if state.frames % 2 == 0 {state.jitter} else {0};
        state.dc_time += state.cycle + deviation;

        let SimState {slaves, layout, image: sent, ..} = &mut *state;
        let mut wkc = 0;
        for (slave, regions) in slaves.iter_mut().zip(layout.iter()) {
            if ! slave.present
                {continue}
            let current = slave.state & 0x0f;
            if (current == SAFEOP || current == OP) && regions.inputs.bits != 0 {
                let start = regions.inputs.byte;
                image[start .. start + slave.inputs.len()].copy_from_slice(&slave.inputs);
                wkc += 1;
            }
            if current == OP && slave.state & ERROR == 0 && regions.outputs.bits != 0 {
                let start = regions.outputs.byte;
                let end = start + slave.outputs.len();
                if sent.len() >= end
                    {slave.outputs.copy_from_slice(&sent[start .. end])}
                wkc += 2;
            }
        }
        Receive::WorkingCounter(wkc)
    }
    fn dc_time(&self) -> i64 {
        self.lock().dc_time
    }

    fn read_register(&self, slave: u16, address: u16, data: &mut [u8], _timeout: Duration) -> EthercatResult<u16> {
        Ok(self.slave(slave, |slave| {
            data.iter_mut().for_each(|b| *b = 0);
            match address {
                0x0130 => {
                    data[0] = slave.state;
                    if data.len() >= 6
                        {data[4 .. 6].copy_from_slice(&slave.code.to_le_bytes())}
                },
                0x092c => {
                    let magnitude = slave.dc_offset.unsigned_abs() & 0x7fff_ffff;
                    let raw = if slave.dc_offset < 0 {magnitude | 0x8000_0000} else {magnitude};
                    data[.. 4].copy_from_slice(&raw.to_le_bytes());
                },
                0x0300 => {
                    data[0] = slave.rx_errors;
                },
                0x0400 => {
                    data[.. 2].copy_from_slice(&2498u16.to_le_bytes());
                },
                _ => {},
            }
            1
        }).unwrap_or(0))
    }
    fn write_register(&self, slave: u16, address: u16, data: &[u8], _timeout: Duration) -> EthercatResult<u16> {
        Ok(self.slave(slave, |slave| {
            match address {
                0x0420 => slave.watchdog = Some(u16::from_le_bytes([data[0], data[1]])),
                0x0300 => slave.rx_errors = 0,
                _ => {},
            }
            1
        }).unwrap_or(0))
    }
    fn write_state(&self, target: SlaveAddress, request: AlControlRequest) -> EthercatResult<u16> {
        let request = u8::from(request);
        match target {
            SlaveAddress::Slave(index) => Ok(self.slave(index, |slave| {slave.request(request); 1}).unwrap_or(0)),
            SlaveAddress::Broadcast => {
                let mut state = self.lock();
                state.broadcasts.push(request);
                let mut wkc = 0;
                for slave in state.slaves.iter_mut().filter(|slave| slave.present) {
                    slave.request(request);
                    wkc += 1;
                }
                Ok(wkc)
            },
        }
    }
    fn state_check(&self, target: SlaveAddress, _state: AlState, _timeout: Duration) -> EthercatResult<AlStatus> {
        match target {
            SlaveAddress::Slave(index) => self.slave(index, |slave| AlStatus::from(slave.state))
                .ok_or(EthercatError::Timeout("slave did not answer")),
            SlaveAddress::Broadcast => {
                let state = self.lock();
                let lowest = state.slaves.iter()
                    .filter(|slave| slave.present)
                    .map(|slave| slave.state & 0x0f)
                    .min()
                    .unwrap_or(0);
                Ok(AlStatus::from(lowest))
            },
        }
    }

    fn reconfigure_to_preop(&self, slave: u16, _timeout: Duration) -> bool {
        self.slave(slave, |slave| slave.state = PREOP).is_some()
    }
    fn reconfigure_to_safeop(&self, slave: u16, _timeout: Duration) -> bool {
        self.slave(slave, |slave| slave.state = SAFEOP).is_some()
    }
    fn recover_slave(&self, slave: u16, _timeout: Duration) -> bool {
        self.slave(slave, |_| ()).is_some()
    }
    fn dc_sync0(&self, slave: u16, enable: bool, _cycle: Duration, _shift: Duration) {
        self.slave(slave, |slave| slave.sync0 = enable);
    }
    fn disable_complete_access(&self, slave: u16) {
        self.lock().complete_access.push(slave);
    }

    fn sdo_read(&self, slave: u16, index: u16, sub: u8, data: &mut [u8], _timeout: Duration) -> u16 {
        self.lock().sdo_reads.push((slave, index, sub));
        self.slave(slave, |slave| match slave.dictionary.get(&(index, sub)) {
            Some(value) => {
                let len = value.len().min(data.len());
                data[.. len].copy_from_slice(&value[.. len]);
                1
            },
            None => 0,
        }).unwrap_or(0)
    }
    fn sdo_write(&self, slave: u16, index: u16, sub: u8, data: &[u8], _timeout: Duration) -> u16 {
        self.lock().sdo_writes.push((slave, index, sub, data.to_vec()));
        self.slave(slave, |slave| {
            slave.dictionary.insert((index, sub), data.to_vec());
            1
        }).unwrap_or(0)
    }
}

/// disconnect a slave, and make it answer again in INIT like after a power cycle
pub fn unplug(bus: &SimBus, index: usize) {
    bus.lock().slaves[index].present = false;
}
pub fn plug(bus: &SimBus, index: usize) {
    let mut state = bus.lock();
    let slave = &mut state.slaves[index];
    slave.present = true;
    slave.state = INIT;
}
