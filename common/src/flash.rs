/// Output line driving the camera flash LED.
pub trait LampPin {
    type Error: core::fmt::Display;

    fn set_lit(&mut self, lit: bool) -> Result<(), Self::Error>;
}

/// Flash LED together with its on/off state.
#[derive(Debug)]
pub struct FlashLight<P> {
    pin: P,
    lit: bool,
}

impl<P: LampPin> FlashLight<P> {
    /// Takes the pin and drives it low.
    pub fn new(mut pin: P) -> Result<Self, P::Error> {
        pin.set_lit(false)?;
        Ok(Self { pin, lit: false })
    }

    pub fn is_lit(&self) -> bool {
        self.lit
    }

    /// Flips the LED and returns the new state. The recorded state only
    /// changes when the pin accepted the write.
    pub fn toggle(&mut self) -> Result<bool, P::Error> {
        let lit = !self.lit;
        self.pin.set_lit(lit)?;
        self.lit = lit;
        Ok(lit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct FakePin {
        levels: Vec<bool>,
        fail: bool,
    }

    impl LampPin for &mut FakePin {
        type Error = &'static str;

        fn set_lit(&mut self, lit: bool) -> Result<(), Self::Error> {
            if self.fail {
                return Err("gpio busy");
            }
            self.levels.push(lit);
            Ok(())
        }
    }

    #[test]
    fn starts_dark_and_toggles() {
        let mut pin = FakePin::default();
        {
            let mut flash = FlashLight::new(&mut pin).unwrap();
            assert!(!flash.is_lit());
            assert_eq!(flash.toggle(), Ok(true));
            assert_eq!(flash.toggle(), Ok(false));
        }
        assert_eq!(pin.levels, [false, true, false]);
    }

    #[test]
    fn failed_write_keeps_state() {
        let mut pin = FakePin::default();
        let mut flash = FlashLight::new(&mut pin).unwrap();
        flash.pin.fail = true;

        assert_eq!(flash.toggle(), Err("gpio busy"));
        assert!(!flash.is_lit());
    }
}
