use bucket_watch_core::alarm::AlarmTransition;

/// Side effect fired when the alarm enters `Alarm`.
pub trait AlarmAction {
    fn invoke(&self, transition: &AlarmTransition) -> Result<(), String>;
}

impl<F> AlarmAction for F
where
    F: Fn(&AlarmTransition) -> Result<(), String>,
{
    fn invoke(&self, transition: &AlarmTransition) -> Result<(), String> {
        self(transition)
    }
}
