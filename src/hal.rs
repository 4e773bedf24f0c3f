//! ==============================================================================
//! hal.rs - Hardware Abstraction Layer
//! ==============================================================================
//!
//! purpose:
//!     provides the two capabilities the service consumes from the rig:
//!     - LoadCellAmplifier: raw counts from the HX711 in front of the load cell
//!     - PressureAdc: voltages from the ADS1115 the pressure sensors hang off
//!     abstracts away the difference between running on a real Raspberry Pi
//!     (using `rppal`) and a development machine (using mocks).
//!
//! design philosophy:
//!     - "Compile Anywhere": The service should compile on Windows/Mac/Linux.
//!     - "Dumb Drivers": No averaging or calibration here. sensors.rs owns that.
//!     - "Blocking Is Fine": Drivers are synchronous. The gateway runs them on
//!       the blocking pool and serializes access.
//!
//! relationships:
//!     - used by: sensors.rs (SensorGateway)
//!     - uses: rppal (on feature="hardware")
//!
//! ==============================================================================

use anyhow::Result;

use crate::config::ServiceConfig;

/// HX711-style 24-bit load cell amplifier.
pub trait LoadCellAmplifier: Send {
    /// DOUT low means a conversion is waiting to be clocked out.
    fn is_ready(&mut self) -> bool;
    /// Power-cycle the chip, which drops it back to channel A / gain 128.
    fn reset(&mut self) -> Result<()>;
    fn set_gain(&mut self, gain: u8) -> Result<()>;
    /// One raw, sign-extended conversion.
    fn read_raw(&mut self) -> Result<i32>;
}

/// Single-ended ADC channel reader.
pub trait PressureAdc: Send {
    fn read_voltage(&mut self, channel: u8) -> Result<f64>;
}

/// Open both devices for the configured rig.
pub fn open(config: &ServiceConfig) -> Result<(Box<dyn LoadCellAmplifier>, Box<dyn PressureAdc>)> {
    imp::open(config)
}

// ==============================================================================================
// MOCK IMPLEMENTATION (For WSL / Non-Hardware Build)
// ==============================================================================================
#[cfg(not(feature = "hardware"))]
mod imp {
    use super::*;

    pub fn open(config: &ServiceConfig) -> Result<(Box<dyn LoadCellAmplifier>, Box<dyn PressureAdc>)> {
        tracing::info!("Using MOCK HAL (No hardware access)");
        Ok((
            Box::new(MockLoadCell::new(config.scale.gain)),
            Box::new(MockPressureAdc::default()),
        ))
    }

    /// Produces a slowly drifting count around an empty-platform baseline.
    pub struct MockLoadCell {
        gain: u8,
        tick: u32,
    }

    impl MockLoadCell {
        const BASELINE: i32 = 8_400;

        pub fn new(gain: u8) -> Self {
            Self { gain, tick: 0 }
        }
    }

    impl LoadCellAmplifier for MockLoadCell {
        fn is_ready(&mut self) -> bool {
            true
        }

        fn reset(&mut self) -> Result<()> {
            tracing::debug!("[MOCK HX711] reset");
            self.tick = 0;
            Ok(())
        }

        fn set_gain(&mut self, gain: u8) -> Result<()> {
            tracing::debug!("[MOCK HX711] gain {}", gain);
            self.gain = gain;
            Ok(())
        }

        fn read_raw(&mut self) -> Result<i32> {
            self.tick = self.tick.wrapping_add(1);
            // +-3 counts of jitter
            let jitter = (self.tick % 7) as i32 - 3;
            Ok(Self::BASELINE * i32::from(self.gain) / 128 + jitter)
        }
    }

    #[derive(Default)]
    pub struct MockPressureAdc {
        tick: u32,
    }

    impl PressureAdc for MockPressureAdc {
        fn read_voltage(&mut self, channel: u8) -> Result<f64> {
            self.tick = self.tick.wrapping_add(1);
            tracing::trace!("[MOCK ADS1115] channel {}", channel);
            Ok(0.5 + f64::from(channel) * 0.25 + f64::from(self.tick % 10) * 0.001)
        }
    }
}

// ==============================================================================================
// REAL IMPLEMENTATION (For Raspberry Pi)
// ==============================================================================================
#[cfg(feature = "hardware")]
mod imp {
    use super::*;
    use rppal::gpio::{Gpio, InputPin, OutputPin};
    use rppal::i2c::I2c;
    use std::thread::sleep;
    use std::time::Duration;

    pub fn open(config: &ServiceConfig) -> Result<(Box<dyn LoadCellAmplifier>, Box<dyn PressureAdc>)> {
        tracing::info!("Using REAL HARDWARE HAL (rppal)");
        let hx = Hx711::new(config.scale.dout_pin, config.scale.sck_pin, config.scale.gain)?;
        let ads = Ads1115::new(config.pressure.address()?)?;
        Ok((Box::new(hx), Box::new(ads)))
    }

    const CLOCK_HALF_PERIOD: Duration = Duration::from_micros(1);
    const POWER_DOWN_HOLD: Duration = Duration::from_micros(100);
    const DATA_BITS: u32 = 24;

    pub struct Hx711 {
        dout: InputPin,
        sck: OutputPin,
        /// extra clock pulses after the 24 data bits select the next channel/gain
        gain_pulses: u8,
    }

    impl Hx711 {
        pub fn new(dout_pin: u8, sck_pin: u8, gain: u8) -> Result<Self> {
            let gpio = Gpio::new()?;
            let dout = gpio.get(dout_pin)?.into_input();
            let mut sck = gpio.get(sck_pin)?.into_output();
            sck.set_low();
            Ok(Self { dout, sck, gain_pulses: gain_pulses(gain)? })
        }

        fn pulse(&mut self) -> bool {
            self.sck.set_high();
            sleep(CLOCK_HALF_PERIOD);
            let bit = self.dout.is_high();
            self.sck.set_low();
            sleep(CLOCK_HALF_PERIOD);
            bit
        }
    }

    fn gain_pulses(gain: u8) -> Result<u8> {
        match gain {
            128 => Ok(1),
            64 => Ok(3),
            32 => Ok(2),
            other => anyhow::bail!("HX711 gain must be 128, 64 or 32 (got {})", other),
        }
    }

    impl LoadCellAmplifier for Hx711 {
        fn is_ready(&mut self) -> bool {
            self.dout.is_low()
        }

        fn reset(&mut self) -> Result<()> {
            self.sck.set_high();
            sleep(POWER_DOWN_HOLD);
            self.sck.set_low();
            Ok(())
        }

        fn set_gain(&mut self, gain: u8) -> Result<()> {
            self.gain_pulses = gain_pulses(gain)?;
            Ok(())
        }

        fn read_raw(&mut self) -> Result<i32> {
            if !self.is_ready() {
                anyhow::bail!("HX711 conversion not ready");
            }
            let mut value: u32 = 0;
            for _ in 0..DATA_BITS {
                value = (value << 1) | u32::from(self.pulse());
            }
            for _ in 0..self.gain_pulses {
                self.pulse();
            }
            // sign-extend 24 -> 32 bits
            Ok(((value << 8) as i32) >> 8)
        }
    }

    const REG_CONVERSION: u8 = 0x00;
    const REG_CONFIG: u8 = 0x01;
    const FULL_SCALE_VOLTS: f64 = 4.096;
    const CONVERSION_POLLS: u32 = 20;

    pub struct Ads1115 {
        i2c: I2c,
    }

    impl Ads1115 {
        pub fn new(address: u16) -> Result<Self> {
            let mut i2c = I2c::new()?;
            i2c.set_slave_address(address)?;
            Ok(Self { i2c })
        }

        fn read_register(&mut self, reg: u8) -> Result<u16> {
            let mut buf = [0u8; 2];
            self.i2c.write_read(&[reg], &mut buf)?;
            Ok(u16::from_be_bytes(buf))
        }
    }

    impl PressureAdc for Ads1115 {
        fn read_voltage(&mut self, channel: u8) -> Result<f64> {
            anyhow::ensure!(channel < 4, "ADS1115 has no channel {}", channel);
            // single-shot, AINx vs GND, +-4.096V, 128 SPS, comparator off
            let config: u16 = 0x8000
                | ((4 + u16::from(channel)) << 12)
                | (0b001 << 9)
                | (1 << 8)
                | (0b100 << 5)
                | 0b11;
            let [hi, lo] = config.to_be_bytes();
            self.i2c.write(&[REG_CONFIG, hi, lo])?;

            let mut polls = 0;
            while self.read_register(REG_CONFIG)? & 0x8000 == 0 {
                polls += 1;
                anyhow::ensure!(polls < CONVERSION_POLLS, "ADS1115 conversion timed out");
                sleep(Duration::from_millis(1));
            }

            let raw = self.read_register(REG_CONVERSION)? as i16;
            Ok(f64::from(raw) * FULL_SCALE_VOLTS / 32768.0)
        }
    }
}

// ==============================================================================================
// SCRIPTED FAKES (tests only)
// ==============================================================================================
#[cfg(test)]
pub mod fake {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Debug, Default)]
    pub struct FakeScaleState {
        pub raw: i32,
        pub ready: bool,
        pub failing: bool,
        pub resets: usize,
        pub reads: usize,
        /// conversion time per read, like a real 10/80 SPS part
        pub read_delay: Duration,
    }

    /// Cloneable handle, so a test keeps control after boxing one into the gateway.
    #[derive(Clone, Default)]
    pub struct FakeScale(pub Arc<Mutex<FakeScaleState>>);

    impl FakeScale {
        pub fn new(raw: i32) -> Self {
            Self(Arc::new(Mutex::new(FakeScaleState { raw, ready: true, ..Default::default() })))
        }

        pub fn set_raw(&self, raw: i32) {
            self.0.lock().unwrap().raw = raw;
        }

        pub fn set_ready(&self, ready: bool) {
            self.0.lock().unwrap().ready = ready;
        }

        pub fn set_failing(&self, failing: bool) {
            self.0.lock().unwrap().failing = failing;
        }

        pub fn set_read_delay(&self, delay: Duration) {
            self.0.lock().unwrap().read_delay = delay;
        }

        pub fn resets(&self) -> usize {
            self.0.lock().unwrap().resets
        }

        pub fn reads(&self) -> usize {
            self.0.lock().unwrap().reads
        }
    }

    impl LoadCellAmplifier for FakeScale {
        fn is_ready(&mut self) -> bool {
            self.0.lock().unwrap().ready
        }

        fn reset(&mut self) -> Result<()> {
            self.0.lock().unwrap().resets += 1;
            Ok(())
        }

        fn set_gain(&mut self, _gain: u8) -> Result<()> {
            Ok(())
        }

        fn read_raw(&mut self) -> Result<i32> {
            let delay = self.0.lock().unwrap().read_delay;
            if !delay.is_zero() {
                std::thread::sleep(delay);
            }
            let mut state = self.0.lock().unwrap();
            if state.failing {
                anyhow::bail!("fake HX711 read failure");
            }
            state.reads += 1;
            Ok(state.raw)
        }
    }

    #[derive(Debug, Default)]
    pub struct FakePressureState {
        pub volts: [f64; 3],
        pub failing_channel: Option<u8>,
    }

    #[derive(Clone, Default)]
    pub struct FakePressure(pub Arc<Mutex<FakePressureState>>);

    impl FakePressure {
        pub fn new(volts: [f64; 3]) -> Self {
            Self(Arc::new(Mutex::new(FakePressureState { volts, failing_channel: None })))
        }

        pub fn fail_channel(&self, channel: Option<u8>) {
            self.0.lock().unwrap().failing_channel = channel;
        }
    }

    impl PressureAdc for FakePressure {
        fn read_voltage(&mut self, channel: u8) -> Result<f64> {
            let state = self.0.lock().unwrap();
            if state.failing_channel == Some(channel) {
                anyhow::bail!("fake ADS1115 channel {} failure", channel);
            }
            Ok(state.volts[channel as usize])
        }
    }
}
