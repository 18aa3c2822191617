use crate::error::AlephError;

/// Pack `(creator, height)` into a single id.
pub fn unit_id(creator: u16, height: u32, n_proc: u16) -> u64 {
    height as u64 * n_proc as u64 + creator as u64
}

/// Inverse of [`unit_id`]: returns `(creator, height)`.
pub fn decode_unit_id(id: u64, n_proc: u16) -> (u16, u32) {
    let n_proc = n_proc as u64;
    ((id % n_proc) as u16, (id / n_proc) as u32)
}

/// RMC instance id of the alert raised by `raiser` against `forker`.
pub fn alert_id(forker: u16, raiser: u16, n_proc: u16) -> u64 {
    forker as u64 + raiser as u64 * n_proc as u64
}

/// Returns `(forker, raiser)`.
pub fn decode_alert_id(id: u64, n_proc: u16) -> Result<(u16, u16), AlephError> {
    let n = n_proc as u64;
    let forker = id % n;
    let raiser = id / n;
    if raiser >= n || raiser == forker {
        return Err(AlephError::InvalidAlertId(id));
    }
    Ok((forker as u16, raiser as u16))
}

pub fn validate_workers(name: &str, workers: (usize, usize)) -> Result<(), AlephError> {
    if workers.0 == 0 || workers.1 == 0 {
        return Err(AlephError::InvalidConfiguration(format!(
            "{name} needs at least one inbound and one outbound worker"
        )));
    }
    Ok(())
}
