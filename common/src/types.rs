#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatingMode {
    Provisioning,
    Connecting,
    Operational,
}

impl OperatingMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Provisioning => "PROVISIONING",
            Self::Connecting => "CONNECTING",
            Self::Operational => "OPERATIONAL",
        }
    }

    /// Legal mode transitions within a single boot. Provisioning is terminal;
    /// it only ends through a restart.
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Connecting, Self::Operational)
                | (Self::Connecting, Self::Provisioning)
                | (Self::Operational, Self::Provisioning)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeCause {
    ColdBoot,
    ButtonWake,
    TimerWake,
    Other,
}

impl WakeCause {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ColdBoot => "COLD_BOOT",
            Self::ButtonWake => "BUTTON_WAKE",
            Self::TimerWake => "TIMER_WAKE",
            Self::Other => "OTHER",
        }
    }
}

/// How a boot ends. Both exits discard all volatile state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootExit {
    Restart,
    DeepSleep,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provisioning_is_terminal() {
        for next in [
            OperatingMode::Provisioning,
            OperatingMode::Connecting,
            OperatingMode::Operational,
        ] {
            assert!(!OperatingMode::Provisioning.can_transition_to(next));
        }
    }

    #[test]
    fn connecting_leads_to_operational_or_provisioning() {
        assert!(OperatingMode::Connecting.can_transition_to(OperatingMode::Operational));
        assert!(OperatingMode::Connecting.can_transition_to(OperatingMode::Provisioning));
        assert!(!OperatingMode::Operational.can_transition_to(OperatingMode::Connecting));
        assert!(OperatingMode::Operational.can_transition_to(OperatingMode::Provisioning));
    }
}
