#![cfg_attr(target_os = "none", no_main)]
#![cfg_attr(target_os = "none", no_std)]

//! Digital transport controller firmware for a professional analog
//! multitrack tape machine. Replaces the original reel-motor servo
//! electronics: a 500 Hz servo loop regulates the two reel motor torques
//! through a dual DAC, a pair of cooperating tasks sequences the transport
//! solenoids and servo modes, and a framed serial link accepts commands
//! from the companion controller.
//!
//! Task layout (hardware tasks on timer/UART interrupts, highest first):
//! tach edge capture, servo loop (2 ms), tach watchdog, transport
//! controller (5 ms), IPC server (UART idle), button poll (10 ms).

mod control_interface;
mod drivers;
mod iomap;
mod params;
mod pid;
mod protocols;
mod state;
mod transport_ctrls;
mod util;

#[cfg(target_os = "none")]
mod cfg_storage;
#[cfg(target_os = "none")]
mod sensors_shared;
#[cfg(target_os = "none")]
mod setup;

#[cfg(target_os = "none")]
use cortex_m::{asm, delay::Delay};
#[cfg(target_os = "none")]
use defmt::println;
#[cfg(target_os = "none")]
use defmt_rtt as _;
#[cfg(target_os = "none")]
use hal::{
    clocks::{Clocks, InputSrc, PllSrc},
    dma::{self, Dma},
    flash::Flash,
    pac,
    spi::Spi,
    timer::{Timer, TimerInterrupt},
    usart::Usart,
};
#[cfg(target_os = "none")]
use panic_probe as _;

#[cfg(target_os = "none")]
use crate::{
    control_interface::{CommandTranslator, InputPoll},
    drivers::{
        dac_tlv5637::MotorDac,
        ioexp_mcp23s17::{PortsIo, TransportPorts},
        reel_qei::ReelQei,
        tape_tach::TapeTach,
    },
    iomap::*,
    params::{SystemParams, TapeWidth},
    protocols::{
        ipc::{frame_tx, ByteWrite, Fcb, FrameKind, IpcError, RxAccum},
        ipc_cmd::{IpcServer, MSG_BUF_SIZE},
    },
    state::{ModeCtl, ServoState},
    transport_ctrls::{sequencer::CmdMailbox, sequencer::Sequencer, ServoInputs},
};

// Every x button polls (10 ms each), toggle the heartbeat LED.
#[cfg(target_os = "none")]
const HEARTBEAT_POLL_RATIO: u8 = 50;

// Every x button polls, print system status and sensor readings to console,
// if enabled with the `print-status` feature.
#[cfg(all(target_os = "none", feature = "print-status"))]
const PRINT_STATUS_RATIO: u32 = 200;

/// UART sink for IPC reply frames.
#[cfg(target_os = "none")]
struct UartWriter<'a> {
    uart: &'a mut Usart<pac::USART2>,
}

#[cfg(target_os = "none")]
impl ByteWrite for UartWriter<'_> {
    fn write_all(&mut self, buf: &[u8]) -> Result<(), IpcError> {
        self.uart.write(buf).map_err(|_| IpcError::Timeout)
    }
}

#[cfg(target_os = "none")]
#[rtic::app(device = pac, peripherals = false, dispatchers = [EXTI9_5])]
mod app {
    use super::*;

    #[shared]
    struct Shared {
        params: SystemParams,
        mode_ctl: ModeCtl,
        servo: ServoState,
        spi1: Spi<pac::SPI1>,
        ports: TransportPorts,
        cmd_mbox: CmdMailbox,
        tach: TapeTach,
        hi_speed: bool,
        dip_switches: u8,

        // Held only so the conversions and timers keep running.
        _adc: hal::adc::Adc<pac::ADC1>,
        _dma: Dma<pac::DMA1>,
        _tim_servo: Timer<pac::TIM15>,
        _tim_poll: Timer<pac::TIM16>,
        _tim_ctrl: Timer<pac::TIM17>,
        _tim_tach_wd: Timer<pac::TIM5>,
    }

    #[local]
    struct Local {
        dac: MotorDac,
        qei_supply: ReelQei,
        qei_takeup: ReelQei,
        width_servo: TapeWidth,

        sequencer: Sequencer,

        input_poll: InputPoll,
        translator: CommandTranslator,
        heartbeat: u8,
        status_i: u32,

        uart_ipc: Usart<pac::USART2>,
        rx_accum: RxAccum,
        ipc_server: IpcServer,
        flash: Flash,
        width_ipc: TapeWidth,
    }

    #[init]
    fn init(cx: init::Context) -> (Shared, Local) {
        let cp = cx.core;
        let dp = pac::Peripherals::take().unwrap();

        let clock_cfg = Clocks {
            input_src: InputSrc::Pll(PllSrc::Hse(16_000_000)),
            ..Default::default()
        };

        clock_cfg.setup().unwrap();

        let (cs_dac, cs_switch, cs_solenoid, width) = setup::setup_pins();

        let mut spi1 = setup::setup_spi(dp.SPI1);

        // Zero torque on the reel motors before anything else runs.
        let mut dac = MotorDac::new(cs_dac);
        dac.init(&mut spi1);

        let mut ports = TransportPorts::new(cs_switch, cs_solenoid);
        if ports.init(&mut spi1).is_err() {
            panic!("I/O expander init failed");
        }

        let mut delay = Delay::new(cp.SYST, clock_cfg.systick());

        // Initial mode switch states: speed select and config DIPs.
        let mode_bits = ports.read_mode_switches(&mut spi1).unwrap_or(0);
        let hi_speed = mode_bits & M_HISPEED != 0;
        let dip_switches = mode_bits & M_DIPSW_MASK;

        println!(
            "Tape width {}, hi-speed {}, DIP {:x}",
            width,
            hi_speed,
            dip_switches
        );

        // Parameter record from the width-selected flash slot; falls back
        // to defaults (and heals the slot) on a header mismatch.
        let mut flash = Flash::new(dp.FLASH);
        let (params, load_status) = cfg_storage::load(&mut flash, width);

        if load_status == 0 {
            // Blink each lamp in turn to show a clean start.
            for lamp in [L_REC, L_PLAY, L_STOP, L_FWD, L_REW] {
                ports.set_lamps_now(&mut spi1, lamp);
                delay.delay_ms(100);
            }
            ports.set_lamps_now(&mut spi1, 0);
        } else {
            // Flash all three status LEDs to flag the parameter reload.
            for _ in 0..5 {
                ports.set_lamps_now(&mut spi1, L_STAT1 | L_STAT2 | L_STAT3);
                delay.delay_ms(200);
                ports.set_lamps_now(&mut spi1, 0);
                delay.delay_ms(100);
            }
        }

        // Reel encoder and tape tach capture hardware.
        setup::setup_encoder_timers();
        setup::setup_tach_capture();

        let uart_ipc = setup::setup_ipc_uart(dp.USART2, &clock_cfg);

        let mut dma = Dma::new(dp.DMA1);
        dma::enable_mux1();

        let mut adc = setup::setup_adc(dp.ADC1, &clock_cfg);
        setup::start_adc(&mut adc, &mut dma);

        // Task tick timers. The servo loop samples at 500 Hz; the
        // controller state machine steps at 200 Hz; buttons poll at 100 Hz.
        let mut tim_servo = Timer::new_tim15(dp.TIM15, 500., Default::default(), &clock_cfg);
        tim_servo.enable_interrupt(TimerInterrupt::Update);

        let mut tim_ctrl = Timer::new_tim17(dp.TIM17, 200., Default::default(), &clock_cfg);
        tim_ctrl.enable_interrupt(TimerInterrupt::Update);

        let mut tim_poll = Timer::new_tim16(dp.TIM16, 100., Default::default(), &clock_cfg);
        tim_poll.enable_interrupt(TimerInterrupt::Update);

        // Absent-edge watchdog: fed by every tach edge, fires after half a
        // second of roller standstill.
        let mut tim_tach_wd = Timer::new_tim5(dp.TIM5, 2., Default::default(), &clock_cfg);
        tim_tach_wd.enable_interrupt(TimerInterrupt::Update);

        tim_servo.enable();
        tim_ctrl.enable();
        tim_poll.enable();
        tim_tach_wd.enable();

        println!("Init complete; servo in HALT until the tape state is read");

        (
            Shared {
                params,
                mode_ctl: ModeCtl::default(),
                servo: ServoState::default(),
                spi1,
                ports,
                cmd_mbox: CmdMailbox::default(),
                tach: TapeTach::new(setup::TACH_CLOCK_HZ),
                hi_speed,
                dip_switches,
                _adc: adc,
                _dma: dma,
                _tim_servo: tim_servo,
                _tim_poll: tim_poll,
                _tim_ctrl: tim_ctrl,
                _tim_tach_wd: tim_tach_wd,
            },
            Local {
                dac,
                qei_supply: ReelQei::default(),
                qei_takeup: ReelQei::default(),
                width_servo: width,
                sequencer: Sequencer::default(),
                input_poll: InputPoll::default(),
                translator: CommandTranslator::default(),
                heartbeat: 0,
                status_i: 0,
                uart_ipc,
                rx_accum: RxAccum::default(),
                ipc_server: IpcServer::default(),
                flash,
                width_ipc: width,
            },
        )
    }

    #[idle(shared = [], local = [])]
    fn idle(_cx: idle::Context) -> ! {
        loop {
            asm::nop();
        }
    }

    /// Tape roller tach edge: record the capture timestamp and feed the
    /// absent-edge watchdog. This ISR owns nothing but the tach ring.
    #[task(binds = TIM2, shared = [tach], priority = 8)]
    fn tach_edge_isr(mut cx: tach_edge_isr::Context) {
        if let Some(ts) = setup::read_tach_capture() {
            cx.shared.tach.lock(|tach| tach.on_edge(ts));
            setup::tach_watchdog_feed();
        }

        // Drop any overcapture so the interrupt line releases.
        unsafe {
            (*pac::TIM2::ptr()).sr.modify(|_, w| w.cc1of().clear_bit());
        }
    }

    /// Half a second with no roller edges: the tape is not moving.
    #[task(binds = TIM5, shared = [tach], priority = 6)]
    fn tach_timeout_isr(mut cx: tach_timeout_isr::Context) {
        unsafe {
            (*pac::TIM5::ptr()).sr.modify(|_, w| w.uif().clear_bit());
        }

        cx.shared.tach.lock(|tach| tach.on_timeout());
    }

    /// The reel servo loop, 500 Hz. Samples the encoders, tach and ADC,
    /// runs the mode handler for the current servo mode and writes the two
    /// torque DAC values. Highest-priority periodic work in the system.
    #[task(
        binds = TIM1_BRK_TIM15,
        shared = [servo, mode_ctl, params, spi1, tach, hi_speed],
        local = [dac, qei_supply, qei_takeup, width_servo],
        priority = 7
    )]
    fn servo_tick(mut cx: servo_tick::Context) {
        unsafe {
            (*pac::TIM15::ptr()).sr.modify(|_, w| w.uif().clear_bit());
        }

        let (sup_count, tk_count) = setup::read_encoder_counts();
        let sup = cx.local.qei_supply.sample(sup_count);
        let tk = cx.local.qei_takeup.sample(tk_count);

        let tape_tach = cx.shared.tach.lock(|tach| tach.read());

        let inputs = ServoInputs {
            tape_tach,
            velocity_supply: sup.velocity,
            velocity_takeup: tk.velocity,
            dir_supply: sup.direction,
            dir_takeup: tk.direction,
            adc: sensors_shared::adc_snapshot(),
        };

        let width = *cx.local.width_servo;

        (
            cx.shared.servo,
            cx.shared.mode_ctl,
            cx.shared.params,
            cx.shared.spi1,
            cx.shared.hi_speed,
        )
            .lock(|servo, ctl, params, spi, hi_speed| {
                servo.qei_supply_error_cnt = cx.local.qei_supply.phase_error_cnt;
                servo.qei_takeup_error_cnt = cx.local.qei_takeup.phase_error_cnt;

                let (dac_s, dac_t) = servo.tick(ctl, &inputs, params, width, *hi_speed);

                // A failed SPI write is logged and counted by the driver;
                // the loop just runs again in 2 ms.
                let _ = cx.local.dac.write(spi, dac_s, dac_t);
            });
    }

    /// Transport controller state machine, 5 ms tick: mode transitions,
    /// solenoid sequencing, record latching and pending-stop supervision.
    #[task(
        binds = TIM1_TRG_COM_TIM17,
        shared = [mode_ctl, params, spi1, ports, cmd_mbox, dip_switches],
        local = [sequencer],
        priority = 5
    )]
    fn controller_tick(cx: controller_tick::Context) {
        unsafe {
            (*pac::TIM17::ptr()).sr.modify(|_, w| w.uif().clear_bit());
        }

        let sequencer = cx.local.sequencer;

        (
            cx.shared.mode_ctl,
            cx.shared.params,
            cx.shared.spi1,
            cx.shared.ports,
            cx.shared.cmd_mbox,
            cx.shared.dip_switches,
        )
            .lock(|ctl, params, spi, ports, mbox, dip| {
                // DIP 2 set inhibits the pending-stop lamp blink.
                let blink_enabled = *dip & M_DIPSW2 == 0;

                let mut io = PortsIo { ports, spi };
                sequencer.tick(ctl, &mut io, mbox, params, blink_enabled);
            });
    }

    /// Operator input poll, 10 ms: debounce buttons and switches, translate
    /// chords into commands, keep the lamps and heartbeat LED current.
    #[task(
        binds = TIM1_UP_TIM16,
        shared = [spi1, ports, cmd_mbox, mode_ctl, hi_speed, dip_switches, servo],
        local = [input_poll, translator, heartbeat, status_i],
        priority = 3
    )]
    fn cmd_poll(mut cx: cmd_poll::Context) {
        unsafe {
            (*pac::TIM16::ptr()).sr.modify(|_, w| w.uif().clear_bit());
        }

        // Pull a monitor snapshot; display and the boost LED work from the
        // copy, never from live servo state.
        let snap = cx.shared.servo.lock(|servo| servo.snapshot());

        (
            cx.shared.spi1,
            cx.shared.ports,
            cx.shared.cmd_mbox,
            cx.shared.mode_ctl,
            cx.shared.hi_speed,
            cx.shared.dip_switches,
        )
            .lock(|spi, ports, mbox, ctl, hi_speed, dip| {
                // Heartbeat LED on the transport interface card.
                *cx.local.heartbeat += 1;
                if *cx.local.heartbeat >= HEARTBEAT_POLL_RATIO {
                    *cx.local.heartbeat = 0;
                    ports.toggle_lamps(L_STAT1);
                }

                // Play boost window mirror.
                if snap.play_boost_count > 0 {
                    ports.set_lamp_mask(L_STAT3, 0);
                } else if snap.mode == crate::state::ServoMode::Play {
                    ports.set_lamp_mask(0, L_STAT3);
                }

                let tran_raw = ports.read_transport_switches(spi);
                let mode_raw = ports.read_mode_switches(spi);

                if let (Ok(tran_raw), Ok(mode_raw)) = (tran_raw, mode_raw) {
                    let events = cx.local.input_poll.poll(tran_raw, mode_raw);

                    if let Some((hs, dip_bits)) = events.mode_switches {
                        *hi_speed = hs;
                        *dip = dip_bits;
                    }

                    let servo_mode = ctl.mode();
                    let record_held = ports.transport_mask() & T_RECH != 0;

                    if let Some(tape_bits) = events.tape {
                        if let Some(cmd) =
                            cx.local.translator.translate(tape_bits, servo_mode, record_held)
                        {
                            mbox.post(cmd);
                        }
                    }

                    if let Some(buttons) = events.buttons {
                        if buttons != 0 {
                            if let Some(cmd) =
                                cx.local.translator.translate(buttons, servo_mode, record_held)
                            {
                                mbox.post(cmd);
                            }
                        }
                    }
                }

                ports.flush_lamps(spi);
            });

        #[cfg(feature = "print-status")]
        {
            *cx.local.status_i += 1;
            if *cx.local.status_i % PRINT_STATUS_RATIO == 0 {
                println!(
                    "mode {} vel {} (s {} t {}) tach {} tension {} dac s/t {}/{} null {} boost {}",
                    snap.mode,
                    snap.velocity,
                    snap.velocity_supply,
                    snap.velocity_takeup,
                    snap.tape_tach,
                    snap.tsense,
                    snap.dac_supply,
                    snap.dac_takeup,
                    snap.offset_null,
                    snap.play_boost_count,
                );
            }
        }
    }

    /// IPC server: bytes land in the accumulator from the RX interrupt;
    /// on line idle, complete frames are parsed and dispatched, and the
    /// reply goes straight back out the UART.
    #[task(
        binds = USART2,
        shared = [params, mode_ctl, cmd_mbox],
        local = [uart_ipc, rx_accum, ipc_server, flash, width_ipc],
        priority = 4
    )]
    fn ipc_isr(cx: ipc_isr::Context) {
        let regs = unsafe { &(*pac::USART2::ptr()) };

        // Drain everything the UART has.
        while regs.isr.read().rxne().bit_is_set() {
            let byte = regs.rdr.read().rdr().bits() as u8;
            if !cx.local.rx_accum.push(byte) {
                defmt::warn!("IPC rx accumulator overflow; dropping");
            }
        }

        if !regs.isr.read().idle().bit_is_set() {
            return;
        }
        regs.icr.write(|w| w.idlecf().set_bit());

        let server = cx.local.ipc_server;
        let uart = cx.local.uart_ipc;
        let accum = cx.local.rx_accum;

        (cx.shared.params, cx.shared.mode_ctl, cx.shared.cmd_mbox).lock(|params, ctl, mbox| {
            loop {
                let mut req_fcb = Fcb::default();
                let mut text = [0u8; MSG_BUF_SIZE];

                let result = match accum.take_frame(&mut req_fcb, &mut text) {
                    None => break,
                    Some(r) => r,
                };

                match result {
                    Ok(n) => {
                        let kind = req_fcb.kind();
                        if kind != Ok(FrameKind::MsgOnly) {
                            // ACKs and datagrams from the peer need no
                            // reply; anything else is not ours to answer.
                            continue;
                        }

                        let mut store = cfg_storage::FlashStore {
                            flash: &mut *cx.local.flash,
                            width: *cx.local.width_ipc,
                        };

                        let mut reply = [0u8; MSG_BUF_SIZE];
                        let (mut reply_fcb, len) = server.dispatch(
                            &req_fcb,
                            &text[..n],
                            &mut reply,
                            params,
                            &mut store,
                            mbox,
                            ctl.mode(),
                        );

                        let mut w = UartWriter { uart: &mut *uart };
                        if frame_tx(&mut w, &mut reply_fcb, &reply[..len]).is_err() {
                            defmt::warn!("IPC reply transmit failed");
                        }
                    }

                    Err(e) => {
                        defmt::warn!("IPC frame error: {}", e);

                        // Frame-shaped garbage gets a NAK so the peer can
                        // retry; sync noise is silently dropped.
                        let nak = matches!(
                            e,
                            IpcError::Crc
                                | IpcError::RxOverflow
                                | IpcError::TextLen
                                | IpcError::AckLen
                                | IpcError::FrameLen
                        );

                        if nak {
                            let mut fcb = Fcb::new(FrameKind::NakOnly);
                            fcb.acknak = req_fcb.seqnum;

                            let mut w = UartWriter { uart: &mut *uart };
                            let _ = frame_tx(&mut w, &mut fcb, &[]);
                        }
                    }
                }
            }
        });
    }
}

#[cfg(not(target_os = "none"))]
fn main() {}
