//! Platform-agnostic driver for the ADS1255/ADS1256 24-bit delta-sigma ADC devices
//!
//! ## Usage
//!
//! The driver talks to the converter over a shared SPI bus ([`SpiBus`]) with a dedicated
//! chip-select pin and polls the active-low DRDY line to pace conversions. Chip-select is
//! managed by the driver itself because the multi-channel sampling pipeline holds it low
//! across a wait/read/reprogram sequence; hand the driver the raw bus, not an
//! `SpiDevice`. Configure the bus for SPI mode 1, MSB first, with an SCLK no faster than
//! fCLKIN/4 before constructing the driver.
//!
//! A typical session:
//!
//! 1. [`Ads1256::init`]: stop any continuous read-out left over from a previous run and
//!    verify the factory chip ID.
//! 2. [`Ads1256::configure`]: program gain and data rate in one framed register burst.
//! 3. [`Ads1256::install_channels`]: declare the scan list, built with
//!    [`ChannelList::from_count`] or parsed from a channel specification string such as
//!    `"0,2-3,5:6"` with [`ChannelList::from_spec`].
//! 4. [`Ads1256::run_pass`] (or [`Ads1256::run`]): read one calibrated voltage per
//!    channel per pass.
//!
//! Multi-channel scans pipeline the converter's settling time: while channel `i` is being
//! read out, the multiplexer has already been committed to channel `i + 1`, so the
//! per-channel settling delay overlaps the SPI transfer instead of being paid serially.
//! The result read after a reprogram therefore belongs to the *previous* channel; the
//! pipeline accounts for the one-slot offset internally and [`Ads1256::run_pass`] always
//! returns voltages in channel-list order.
//!
//! [ADS1256 datasheet](https://www.ti.com/lit/ds/symlink/ads1256.pdf)
#![cfg_attr(not(test), no_std)]
use core::sync::atomic::{AtomicBool, Ordering};
use embedded_hal::{
    delay::DelayNs,
    digital::{InputPin, OutputPin},
    spi::SpiBus,
};

//==================================================================================================
// Register and command definitions
//==================================================================================================

/// Register map, ADS1256 datasheet Table 23.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Register {
    Status = 0x00,
    Mux = 0x01,
    AdControl = 0x02,
    DataRate = 0x03,
    Gpio = 0x04,
    OffsetCal0 = 0x05,
    OffsetCal1 = 0x06,
    OffsetCal2 = 0x07,
    FullScaleCal0 = 0x08,
    FullScaleCal1 = 0x09,
    FullScaleCal2 = 0x0A,
}

/// Command set, ADS1256 datasheet Table 24.
///
/// Chip-select must stay asserted for the whole byte sequence of a command; the driver
/// frames every exchange accordingly.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Command {
    /// Completes SYNC and exits standby mode
    Wakeup = 0x00,
    /// Read the 24-bit conversion result
    ReadData = 0x01,
    /// Read data continuously
    ReadDataContinuous = 0x03,
    /// Stop reading data continuously
    StopReadContinuous = 0x0F,
    /// Read from register, `0x10 | reg`
    ReadReg = 0x10,
    /// Write to register, `0x50 | reg`
    WriteReg = 0x50,
    /// Offset and gain self-calibration
    SelfCal = 0xF0,
    /// Offset self-calibration
    SelfOffsetCal = 0xF1,
    /// Gain self-calibration
    SelfGainCal = 0xF2,
    /// System offset calibration
    SystemOffsetCal = 0xF3,
    /// System gain calibration
    SystemGainCal = 0xF4,
    /// Synchronize the A/D conversion
    Sync = 0xFC,
    /// Enter standby mode
    Standby = 0xFD,
    /// Reset to power-up register values
    Reset = 0xFE,
}

/// Factory-programmed ID in the top nibble of the STATUS register.
pub const CHIP_ID: u8 = 3;

/// Mux nibble selecting the AINCOM pin instead of a numbered input.
pub const AINCOM: u8 = 8;

/// t6: delay between the last command bit and the first read-out bit.
/// The datasheet minimum is 50 CLKIN periods (6.5 us at 7.68 MHz).
const T6_DELAY_US: u32 = 10;
/// Bus settle gap between SYNC and WAKEUP.
const CMD_GAP_US: u32 = 5;
/// Settle time after WAKEUP before the read-out starts.
const WAKEUP_SETTLE_US: u32 = 25;
/// Settle time after the configuration register burst.
const CONFIG_SETTLE_US: u32 = 50;
/// DRDY poll granularity.
const DRDY_POLL_US: u32 = 1;
/// DRDY bound used before a data rate is configured; covers the slowest rate.
const PROBE_TIMEOUT_US: u32 = 2 * 400_180;

/// Full-scale output code of the 24-bit converter relative to ±2 * VREF, i.e. 2^22.
const FULL_SCALE_CODE: f64 = 4_194_304.0;

//==================================================================================================
// Gain and data rate tables
//==================================================================================================

/// Programmable gain amplifier setting, PGA bits of the ADCON register.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Gain {
    G1 = 0b000,
    G2 = 0b001,
    G4 = 0b010,
    G8 = 0b011,
    G16 = 0b100,
    G32 = 0b101,
    G64 = 0b110,
}

impl Gain {
    /// Looks up a gain from its plain numeric value (1, 2, 4, ... 64).
    pub fn from_value(value: u8) -> Option<Self> {
        Some(match value {
            1 => Gain::G1,
            2 => Gain::G2,
            4 => Gain::G4,
            8 => Gain::G8,
            16 => Gain::G16,
            32 => Gain::G32,
            64 => Gain::G64,
            _ => return None,
        })
    }

    /// Amplification factor as a plain number.
    pub fn value(self) -> u8 {
        1 << self as u8
    }

    fn adcon_bits(self) -> u8 {
        // CLKOUT off, sensor detect off, PGA bits 2..0
        self as u8
    }
}

/// Output data rate, one of the 16 rates the DRATE register supports.
///
/// Each rate carries its DRATE register encoding plus the timing constants the sampling
/// pipeline needs: the worst-case settling time after a mux or configuration change
/// (datasheet Table 13) and the nominal conversion period.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DataRate {
    Sps30000 = 0,
    Sps15000 = 1,
    Sps7500 = 2,
    Sps3750 = 3,
    Sps2000 = 4,
    Sps1000 = 5,
    Sps500 = 6,
    Sps100 = 7,
    Sps60 = 8,
    Sps50 = 9,
    Sps30 = 10,
    Sps25 = 11,
    Sps15 = 12,
    Sps10 = 13,
    Sps5 = 14,
    Sps2_5 = 15,
}

struct RateInfo {
    /// Nominal rate in SPS; the 2.5 SPS entry is stored as 2.
    sps: u32,
    /// DRATE register encoding
    reg: u8,
    /// Worst-case settling time after a mux change, microseconds
    settling_us: u32,
    /// Nominal conversion period, microseconds
    period_us: u32,
}

#[rustfmt::skip]
const RATE_TABLE: [RateInfo; 16] = [
    RateInfo { sps: 30000, reg: 0xF0, settling_us:     210, period_us:      33 },
    RateInfo { sps: 15000, reg: 0xE0, settling_us:     250, period_us:      66 },
    RateInfo { sps:  7500, reg: 0xD0, settling_us:     310, period_us:     133 },
    RateInfo { sps:  3750, reg: 0xC0, settling_us:     440, period_us:     266 },
    RateInfo { sps:  2000, reg: 0xB0, settling_us:     680, period_us:     500 },
    RateInfo { sps:  1000, reg: 0xA1, settling_us:   1_180, period_us:   1_000 },
    RateInfo { sps:   500, reg: 0x92, settling_us:   2_180, period_us:   2_000 },
    RateInfo { sps:   100, reg: 0x82, settling_us:  10_180, period_us:  10_000 },
    RateInfo { sps:    60, reg: 0x72, settling_us:  16_840, period_us:  16_666 },
    RateInfo { sps:    50, reg: 0x63, settling_us:  20_180, period_us:  20_000 },
    RateInfo { sps:    30, reg: 0x53, settling_us:  33_510, period_us:  33_333 },
    RateInfo { sps:    25, reg: 0x43, settling_us:  40_180, period_us:  40_000 },
    RateInfo { sps:    15, reg: 0x33, settling_us:  66_840, period_us:  66_666 },
    RateInfo { sps:    10, reg: 0x23, settling_us: 100_180, period_us: 100_000 },
    RateInfo { sps:     5, reg: 0x13, settling_us: 200_180, period_us: 200_000 },
    RateInfo { sps:     2, reg: 0x03, settling_us: 400_180, period_us: 400_000 },
];

impl DataRate {
    /// Looks up a rate from its value in samples per second. The 2.5 SPS rate matches
    /// on `2`.
    pub fn from_sps(sps: u32) -> Option<Self> {
        const RATES: [DataRate; 16] = [
            DataRate::Sps30000,
            DataRate::Sps15000,
            DataRate::Sps7500,
            DataRate::Sps3750,
            DataRate::Sps2000,
            DataRate::Sps1000,
            DataRate::Sps500,
            DataRate::Sps100,
            DataRate::Sps60,
            DataRate::Sps50,
            DataRate::Sps30,
            DataRate::Sps25,
            DataRate::Sps15,
            DataRate::Sps10,
            DataRate::Sps5,
            DataRate::Sps2_5,
        ];
        RATES.iter().find(|rate| rate.info().sps == sps).copied()
    }

    fn info(self) -> &'static RateInfo {
        &RATE_TABLE[self as usize]
    }

    /// DRATE register encoding for this rate.
    pub fn reg_value(self) -> u8 {
        self.info().reg
    }

    /// Worst-case settling time after a mux or configuration change, in microseconds.
    ///
    /// A data-ready poll started right after a register write must be bounded by at
    /// least this much to not time out spuriously.
    pub fn settling_time_us(self) -> u32 {
        self.info().settling_us
    }

    /// Nominal time between conversions, in microseconds.
    pub fn period_us(self) -> u32 {
        self.info().period_us
    }
}

//==================================================================================================
// Errors
//==================================================================================================

/// Converter-level errors, independent of the bus and pin types.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AdcError {
    /// The STATUS register's factory ID nibble did not read back as [`CHIP_ID`]
    BadChipId(u8),
    /// A bounded data-ready wait elapsed where readiness is mandatory (startup paths)
    Timeout,
    /// Sampling was requested before [`Ads1256::configure`]
    NotConfigured,
    /// Sampling was requested without an installed channel list
    NoChannels,
}

/// Driver error, generic over the SPI bus and pin error types.
#[derive(Debug)]
pub enum Error<SpiE, OutE, InE> {
    Adc(AdcError),
    Spi(SpiE),
    /// Chip-select pin error
    Output(OutE),
    /// Data-ready pin error
    Input(InE),
}

impl<SpiE, OutE, InE> From<AdcError> for Error<SpiE, OutE, InE> {
    fn from(other: AdcError) -> Self {
        Error::Adc(other)
    }
}

/// Shorthand for [`Error`] instantiated with the error types of a concrete bus and pins.
pub type DriverError<SPI, CS, DRDY> = Error<
    <SPI as embedded_hal::spi::ErrorType>::Error,
    <CS as embedded_hal::digital::ErrorType>::Error,
    <DRDY as embedded_hal::digital::ErrorType>::Error,
>;

/// Channel specification parsing error, borrowing the offending token from the input.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct SpecError<'a> {
    pub token: &'a str,
    pub kind: SpecErrorKind,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SpecErrorKind {
    /// Token is not a decimal index, `a-b` pair or `a:b` range
    Malformed,
    /// A referenced input channel does not exist on this converter
    ChannelOutOfRange,
    /// The specification expands to no channels
    Empty,
    /// The specification expands to more than 8 channels
    TooManyChannels,
}

//==================================================================================================
// Mux programming
//==================================================================================================

/// One MUX register value: positive input in the high nibble, negative input in the low
/// nibble, with [`AINCOM`] encoded as nibble `0x8`.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MuxProgram(u8);

impl MuxProgram {
    /// Single-ended program: `ch` measured against AINCOM. `ch` must be 0..=7.
    pub fn single(ch: u8) -> Option<Self> {
        if ch >= 8 {
            return None;
        }
        Some(MuxProgram((ch << 4) | AINCOM))
    }

    /// Differential program between two input pins. A side with an index >= 8 is routed
    /// to AINCOM; both sides out of range select nothing and are rejected.
    pub fn differential(pos: u8, neg: u8) -> Option<Self> {
        if pos >= 8 && neg >= 8 {
            return None;
        }
        let p = if pos < 8 { pos } else { AINCOM };
        let n = if neg < 8 { neg } else { AINCOM };
        Some(MuxProgram((p << 4) | n))
    }

    /// Raw MUX register value.
    pub fn bits(self) -> u8 {
        self.0
    }

    /// Decodes the program back into its (positive, negative) input selects, with both
    /// AINCOM encodings normalized to [`AINCOM`].
    pub fn inputs(self) -> (u8, u8) {
        let pos = self.0 >> 4;
        let neg = self.0 & 0x0F;
        (
            if pos & 0x8 != 0 { AINCOM } else { pos },
            if neg & 0x8 != 0 { AINCOM } else { neg },
        )
    }
}

/// Ordered scan list of mux programs; insertion order is sampling order.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct ChannelList {
    programs: [MuxProgram; 8],
    len: usize,
}

impl ChannelList {
    /// Builds a list of the first `n` single-ended channels, in index order. `n` is
    /// clamped to 8; zero channels is rejected.
    pub fn from_count(n: u8) -> Option<Self> {
        if n == 0 {
            return None;
        }
        let n = n.min(8);
        let mut programs = [MuxProgram(AINCOM); 8];
        for ch in 0..n {
            programs[ch as usize] = MuxProgram((ch << 4) | AINCOM);
        }
        Some(ChannelList {
            programs,
            len: n as usize,
        })
    }

    /// Parses a comma-separated channel specification.
    ///
    /// Each token is one of:
    /// - a decimal index: single-ended channel against AINCOM,
    /// - `a-b`: explicit differential pair,
    /// - `a:b`: inclusive range of single-ended channels.
    ///
    /// Parsing is all-or-nothing: a single bad token rejects the whole list and reports
    /// the token, nothing is partially applied. Empty tokens (a trailing comma, stray
    /// whitespace) are skipped; a specification with no tokens left is rejected as
    /// [`SpecErrorKind::Empty`].
    pub fn from_spec(spec: &str) -> Result<Self, SpecError<'_>> {
        let mut programs = [MuxProgram(AINCOM); 8];
        let mut len = 0usize;

        for token in spec.split(',') {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            let fail = |kind| SpecError { token, kind };
            let parse = |s: &str| {
                s.trim()
                    .parse::<u8>()
                    .map_err(|_| fail(SpecErrorKind::Malformed))
            };
            let mut push = |programs: &mut [MuxProgram; 8], prog| {
                if len == 8 {
                    return Err(fail(SpecErrorKind::TooManyChannels));
                }
                programs[len] = prog;
                len += 1;
                Ok(())
            };

            if let Some((a, b)) = token.split_once('-') {
                let prog = MuxProgram::differential(parse(a)?, parse(b)?)
                    .ok_or(fail(SpecErrorKind::ChannelOutOfRange))?;
                push(&mut programs, prog)?;
            } else if let Some((a, b)) = token.split_once(':') {
                let (lo, hi) = (parse(a)?, parse(b)?);
                if lo > hi {
                    return Err(fail(SpecErrorKind::Malformed));
                }
                if hi >= 8 {
                    return Err(fail(SpecErrorKind::ChannelOutOfRange));
                }
                for ch in lo..=hi {
                    push(&mut programs, MuxProgram((ch << 4) | AINCOM))?;
                }
            } else {
                let ch = parse(token)?;
                let prog =
                    MuxProgram::single(ch).ok_or(fail(SpecErrorKind::ChannelOutOfRange))?;
                push(&mut programs, prog)?;
            }
        }

        if len == 0 {
            return Err(SpecError {
                token: spec,
                kind: SpecErrorKind::Empty,
            });
        }
        Ok(ChannelList { programs, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The mux programs in sampling order.
    pub fn programs(&self) -> &[MuxProgram] {
        &self.programs[..self.len]
    }
}

//==================================================================================================
// Voltage scaling
//==================================================================================================

/// Converts a raw conversion code to volts for a given gain and reference voltage.
///
/// The converter's full-scale range is ±2 * VREF / gain over the signed 24-bit code
/// space, which works out to `code * vref / gain / 2^22`.
pub fn code_to_volts(code: i32, gain: Gain, vref: f64) -> f64 {
    code as f64 * vref / gain.value() as f64 / FULL_SCALE_CODE
}

//==================================================================================================
// Driver
//==================================================================================================

#[derive(Debug, Clone, Copy)]
struct AdcConfig {
    gain: Gain,
    rate: DataRate,
    drdy_timeout_us: u32,
}

/// Sampling pipeline state; lives for the whole sampling session and is reset only by
/// [`Ads1256::install_channels`].
#[derive(Debug, Clone, Copy)]
struct ScanState {
    channels: Option<ChannelList>,
    volts: [f64; 8],
    needs_sync: bool,
    last_mux: Option<u8>,
    timeouts: u32,
}

impl ScanState {
    const IDLE: ScanState = ScanState {
        channels: None,
        volts: [0.0; 8],
        needs_sync: true,
        last_mux: None,
        timeouts: 0,
    };
}

/// ADS1255/ADS1256 driver.
///
/// Owns the SPI bus handle, the chip-select output, the DRDY input and a delay provider
/// for the fixed inter-command settle times. Single control thread by design: one framed
/// command is in flight at a time, enforced by scoping chip-select assertion to each
/// exchange.
pub struct Ads1256<SPI, CS, DRDY, DELAY> {
    spi: SPI,
    cs: CS,
    drdy: DRDY,
    delay: DELAY,
    vref: f64,
    cfg: Option<AdcConfig>,
    scan: ScanState,
}

impl<SPI, CS, DRDY, DELAY> Ads1256<SPI, CS, DRDY, DELAY>
where
    SPI: SpiBus<u8>,
    CS: OutputPin,
    DRDY: InputPin,
    DELAY: DelayNs,
{
    /// Creates a new driver instance. `vref` is the reference voltage in volts used for
    /// scaling raw codes. No bus traffic happens here; see [`Ads1256::init`].
    pub fn new(spi: SPI, cs: CS, drdy: DRDY, delay: DELAY, vref: f64) -> Self {
        Ads1256 {
            spi,
            cs,
            drdy,
            delay,
            vref,
            cfg: None,
            scan: ScanState::IDLE,
        }
    }

    /// Releases the contained bus and pin resources.
    pub fn release(self) -> (SPI, CS, DRDY, DELAY) {
        (self.spi, self.cs, self.drdy, self.delay)
    }

    //==============================================================================================
    // Framed exchange primitives
    //==============================================================================================

    /// Runs `op` with chip-select asserted, releasing it on every exit path so the
    /// converter sees the enclosed bytes as one atomic command.
    fn framed<R>(
        &mut self,
        op: impl FnOnce(&mut Self) -> Result<R, DriverError<SPI, CS, DRDY>>,
    ) -> Result<R, DriverError<SPI, CS, DRDY>> {
        self.cs.set_low().map_err(Error::Output)?;
        let res = op(self);
        let flushed = self.spi.flush().map_err(Error::Spi);
        let released = self.cs.set_high().map_err(Error::Output);
        let val = res?;
        flushed?;
        released?;
        Ok(val)
    }

    /// Register write without a private chip-select scope, for callers already holding
    /// the bus. Toggling chip-select mid-sequence would abort the in-flight conversion.
    fn write_register_unframed(
        &mut self,
        reg: Register,
        value: u8,
    ) -> Result<(), DriverError<SPI, CS, DRDY>> {
        self.spi
            .write(&[Command::WriteReg as u8 | reg as u8, 0x00, value])
            .map_err(Error::Spi)
    }

    fn send_command_unframed(&mut self, cmd: Command) -> Result<(), DriverError<SPI, CS, DRDY>> {
        self.spi.write(&[cmd as u8]).map_err(Error::Spi)
    }

    /// RDATA read without a private chip-select scope: opcode, t6 settle, then three
    /// result bytes MSB first, sign-extended to `i32`.
    fn read_conversion_unframed(&mut self) -> Result<i32, DriverError<SPI, CS, DRDY>> {
        self.send_command_unframed(Command::ReadData)?;
        self.delay.delay_us(T6_DELAY_US);
        let mut buf = [0u8; 3];
        self.spi.read(&mut buf).map_err(Error::Spi)?;
        Ok(sign_extend_24(buf))
    }

    /// Writes a single register as one framed transaction.
    pub fn write_register(
        &mut self,
        reg: Register,
        value: u8,
    ) -> Result<(), DriverError<SPI, CS, DRDY>> {
        self.framed(|adc| adc.write_register_unframed(reg, value))
    }

    /// Reads a single register as one framed transaction.
    pub fn read_register(&mut self, reg: Register) -> Result<u8, DriverError<SPI, CS, DRDY>> {
        self.framed(|adc| {
            adc.spi
                .write(&[Command::ReadReg as u8 | reg as u8, 0x00])
                .map_err(Error::Spi)?;
            adc.delay.delay_us(T6_DELAY_US);
            let mut buf = [0u8; 1];
            adc.spi.read(&mut buf).map_err(Error::Spi)?;
            Ok(buf[0])
        })
    }

    /// Sends a single-byte command as one framed transaction.
    pub fn send_command(&mut self, cmd: Command) -> Result<(), DriverError<SPI, CS, DRDY>> {
        self.framed(|adc| adc.send_command_unframed(cmd))
    }

    /// Reads the latest completed 24-bit conversion as one framed transaction.
    pub fn read_conversion(&mut self) -> Result<i32, DriverError<SPI, CS, DRDY>> {
        self.framed(|adc| adc.read_conversion_unframed())
    }

    /// Reads a conversion without blocking on the DRDY line.
    ///
    /// Returns [`nb::Error::WouldBlock`] while no conversion result is pending.
    pub fn try_read_sample(&mut self) -> nb::Result<i32, DriverError<SPI, CS, DRDY>> {
        if self.drdy.is_low().map_err(Error::Input)? {
            Ok(self.read_conversion()?)
        } else {
            Err(nb::Error::WouldBlock)
        }
    }

    //==============================================================================================
    // Data-ready waiter
    //==============================================================================================

    /// Polls the active-low DRDY line at a 1 microsecond granularity until it asserts or
    /// at least `timeout_us` of poll delay has elapsed.
    ///
    /// Returns `Ok(false)` on timeout; whether that is an error is the caller's call.
    /// Inside a sampling pass a timeout is absorbed (logged and counted), on startup
    /// paths it is fatal.
    pub fn wait_for_ready(&mut self, timeout_us: u32) -> Result<bool, DriverError<SPI, CS, DRDY>> {
        let mut waited = 0u32;
        loop {
            if self.drdy.is_low().map_err(Error::Input)? {
                return Ok(true);
            }
            if waited >= timeout_us {
                return Ok(false);
            }
            self.delay.delay_us(DRDY_POLL_US);
            waited += DRDY_POLL_US;
        }
    }

    fn drdy_timeout_us(&self) -> u32 {
        match self.cfg {
            Some(cfg) => cfg.drdy_timeout_us,
            None => PROBE_TIMEOUT_US,
        }
    }

    fn note_timeout(&mut self) {
        self.scan.timeouts = self.scan.timeouts.saturating_add(1);
        #[cfg(feature = "defmt")]
        defmt::warn!("DRDY wait timed out, sample may be stale");
    }

    /// Data-ready timeouts absorbed during sampling passes since the last
    /// [`Ads1256::install_channels`].
    pub fn timeout_count(&self) -> u32 {
        self.scan.timeouts
    }

    //==============================================================================================
    // Startup and configuration
    //==============================================================================================

    /// Stops a possibly lingering continuous read-out and verifies the chip ID.
    pub fn init(&mut self) -> Result<(), DriverError<SPI, CS, DRDY>> {
        if !self.wait_for_ready(PROBE_TIMEOUT_US)? {
            return Err(AdcError::Timeout.into());
        }
        self.send_command(Command::StopReadContinuous)?;
        self.delay.delay_us(T6_DELAY_US);
        self.check_chip_id()
    }

    /// Reads the factory ID nibble from the STATUS register.
    ///
    /// Waits for data-ready first; a converter that never becomes ready here is a wiring
    /// or power problem, reported as [`AdcError::Timeout`].
    pub fn probe_chip_id(&mut self) -> Result<u8, DriverError<SPI, CS, DRDY>> {
        let timeout = self.drdy_timeout_us();
        if !self.wait_for_ready(timeout)? {
            return Err(AdcError::Timeout.into());
        }
        Ok(self.read_register(Register::Status)? >> 4)
    }

    /// Probes the chip ID and fails with [`AdcError::BadChipId`] unless it reads back
    /// as [`CHIP_ID`].
    pub fn check_chip_id(&mut self) -> Result<(), DriverError<SPI, CS, DRDY>> {
        let id = self.probe_chip_id()?;
        if id != CHIP_ID {
            return Err(AdcError::BadChipId(id).into());
        }
        Ok(())
    }

    /// Programs gain and data rate.
    ///
    /// Waits for data-ready before touching any register (a converter busy with a prior
    /// operation must not be interrupted), then writes STATUS, MUX, ADCON and DRATE in a
    /// single framed burst. The mapping from arguments to register bytes is
    /// deterministic. Fails with [`AdcError::Timeout`] if the pre-write wait elapses.
    pub fn configure(
        &mut self,
        gain: Gain,
        rate: DataRate,
    ) -> Result<(), DriverError<SPI, CS, DRDY>> {
        let drdy_timeout_us = 2 * rate.settling_time_us();
        // Until the new DRATE byte lands, DRDY still paces at whatever rate the
        // converter is currently running; the pre-write wait is bounded by that rate's
        // timeout, not the new one.
        if !self.wait_for_ready(self.drdy_timeout_us().max(drdy_timeout_us))? {
            return Err(AdcError::Timeout.into());
        }

        // STATUS: MSB-first output, auto-calibration on, input buffer off.
        let status = 1 << 2;
        // MUX reset default: AIN0 against AINCOM.
        let mux = 0x08;
        self.framed(|adc| {
            adc.spi
                .write(&[
                    Command::WriteReg as u8 | Register::Status as u8,
                    0x03, // register count - 1: STATUS through DRATE
                    status,
                    mux,
                    gain.adcon_bits(),
                    rate.reg_value(),
                ])
                .map_err(Error::Spi)
        })?;
        self.delay.delay_us(CONFIG_SETTLE_US);

        self.cfg = Some(AdcConfig {
            gain,
            rate,
            drdy_timeout_us,
        });
        Ok(())
    }

    /// The configured data rate, once [`Ads1256::configure`] has run.
    pub fn data_rate(&self) -> Option<DataRate> {
        self.cfg.map(|cfg| cfg.rate)
    }

    /// Issues a RESET command and waits for the converter to come back. All register
    /// configuration is lost; [`Ads1256::configure`] must run again before sampling.
    pub fn reset(&mut self) -> Result<(), DriverError<SPI, CS, DRDY>> {
        self.send_command(Command::Reset)?;
        if !self.wait_for_ready(PROBE_TIMEOUT_US)? {
            return Err(AdcError::Timeout.into());
        }
        self.cfg = None;
        self.scan = ScanState::IDLE;
        Ok(())
    }

    /// Runs an offset and gain self-calibration and waits for it to complete.
    pub fn self_calibrate(&mut self) -> Result<(), DriverError<SPI, CS, DRDY>> {
        self.send_command(Command::SelfCal)?;
        let timeout = self.drdy_timeout_us();
        if !self.wait_for_ready(timeout)? {
            return Err(AdcError::Timeout.into());
        }
        Ok(())
    }

    //==============================================================================================
    // Sampling pipeline
    //==============================================================================================

    /// Installs the scan list and resets the pipeline state. The first following pass
    /// performs the initial mux write and SYNC/WAKEUP sequence.
    pub fn install_channels(&mut self, channels: ChannelList) {
        self.scan = ScanState {
            channels: Some(channels),
            ..ScanState::IDLE
        };
    }

    /// Read-only view of the installed scan list.
    pub fn channel_list(&self) -> Option<&ChannelList> {
        self.scan.channels.as_ref()
    }

    /// Runs one sampling pass and returns one voltage per channel, in channel-list
    /// order.
    ///
    /// A data-ready timeout inside the pass does not abort it: the affected read
    /// proceeds best-effort (the result may be stale) and [`Ads1256::timeout_count`]
    /// increments. Requires a prior [`Ads1256::configure`] and
    /// [`Ads1256::install_channels`].
    pub fn run_pass(&mut self) -> Result<&[f64], DriverError<SPI, CS, DRDY>> {
        let cfg = self.cfg.ok_or(AdcError::NotConfigured)?;
        let list = self.scan.channels.ok_or(AdcError::NoChannels)?;
        if list.len() == 1 {
            self.single_channel_pass(&cfg, list.programs()[0])?;
        } else {
            self.multi_channel_pass(&cfg, &list)?;
        }
        Ok(&self.scan.volts[..list.len()])
    }

    /// Runs sampling passes until `cancel` is set, invoking `on_pass` with the voltage
    /// vector after each pass. The flag is checked once per pass; an in-flight pass
    /// always completes.
    pub fn run<F>(
        &mut self,
        cancel: &AtomicBool,
        mut on_pass: F,
    ) -> Result<(), DriverError<SPI, CS, DRDY>>
    where
        F: FnMut(&[f64]),
    {
        while !cancel.load(Ordering::Relaxed) {
            let volts = self.run_pass()?;
            on_pass(volts);
        }
        Ok(())
    }

    /// Commits the initial mux program and starts conversions: MUX write, then SYNC and
    /// WAKEUP, each followed by a short bus settle gap.
    fn start_conversions(&mut self, first: MuxProgram) -> Result<(), DriverError<SPI, CS, DRDY>> {
        self.write_register(Register::Mux, first.bits())?;
        self.delay.delay_us(CMD_GAP_US);
        self.send_command(Command::Sync)?;
        self.delay.delay_us(CMD_GAP_US);
        self.send_command(Command::Wakeup)?;
        self.delay.delay_us(WAKEUP_SETTLE_US);
        self.scan.last_mux = Some(first.bits());
        self.scan.needs_sync = false;
        Ok(())
    }

    /// Single-channel steady state: the mux never changes after the initial sync, so
    /// each pass is just a bounded wait and a read.
    fn single_channel_pass(
        &mut self,
        cfg: &AdcConfig,
        program: MuxProgram,
    ) -> Result<(), DriverError<SPI, CS, DRDY>> {
        if self.scan.needs_sync {
            self.start_conversions(program)?;
        }
        if !self.wait_for_ready(cfg.drdy_timeout_us)? {
            self.note_timeout();
        }
        let raw = self.read_conversion()?;
        self.scan.volts[0] = code_to_volts(raw, cfg.gain, self.vref);
        Ok(())
    }

    /// Multi-channel steady state, pipelining the settling time.
    ///
    /// For channel `i` of `m`, inside one chip-select scope: wait for the conversion
    /// started on the previous iteration, commit the mux for channel `(i + 1) % m`
    /// (skipped when unchanged), SYNC + WAKEUP to restart conversion, then read the
    /// completed result for channel `i`. The next channel settles while the current
    /// result is clocked out.
    fn multi_channel_pass(
        &mut self,
        cfg: &AdcConfig,
        list: &ChannelList,
    ) -> Result<(), DriverError<SPI, CS, DRDY>> {
        if self.scan.needs_sync {
            self.start_conversions(list.programs()[0])?;
        }
        let n = list.len();
        for i in 0..n {
            let next = list.programs()[(i + 1) % n].bits();
            let raw = self.framed(|adc| {
                if !adc.wait_for_ready(cfg.drdy_timeout_us)? {
                    adc.note_timeout();
                }
                if adc.scan.last_mux != Some(next) {
                    adc.write_register_unframed(Register::Mux, next)?;
                    adc.delay.delay_us(CMD_GAP_US);
                }
                adc.send_command_unframed(Command::Sync)?;
                adc.delay.delay_us(CMD_GAP_US);
                adc.send_command_unframed(Command::Wakeup)?;
                adc.delay.delay_us(WAKEUP_SETTLE_US);
                adc.read_conversion_unframed()
            })?;
            self.scan.last_mux = Some(next);
            self.scan.volts[i] = code_to_volts(raw, cfg.gain, self.vref);
        }
        Ok(())
    }
}

fn sign_extend_24(buf: [u8; 3]) -> i32 {
    let mut raw = ((buf[0] as u32) << 16) | ((buf[1] as u32) << 8) | buf[2] as u32;
    if raw & 0x80_0000 != 0 {
        raw |= 0xFF00_0000;
    }
    raw as i32
}

//==================================================================================================
// Tests
//==================================================================================================
