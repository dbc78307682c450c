use super::*;

/// A Bitcoin job: the nine `mining.notify` params as received from the pool,
/// with the upstream session id already spliced into coinbase1. Each bound
/// miner then mines a disjoint extranonce space without the pool tracking
/// them individually.
#[derive(Debug, Clone)]
pub(crate) struct JobBtc {
    params: Vec<Value>,
}

impl JobBtc {
    /// Params in order: job id, prevhash, coinbase1, coinbase2, merkle
    /// branches, version, nbits, ntime, clean.
    pub(crate) fn from_notify(params: &Value, session_id: u32) -> Result<Self> {
        let mut params = params
            .as_array()
            .context("notify params is not an array")?
            .clone();

        if params.len() < 9 {
            bail!(
                "notify missing fields, should be 9 fields but only {}",
                params.len()
            );
        }

        let coinbase1 = params[2]
            .as_str()
            .context("wrong notify format, coinbase1 is not a string")?;

        params[2] = json!(format!("{coinbase1}{}", utils::u32_to_hex(session_id)));

        Ok(Self { params })
    }

    pub(crate) fn notify_line(&self, first_job: bool) -> Arc<String> {
        let mut params = self.params.clone();
        if first_job {
            params[8] = json!(true);
        }

        Arc::new(
            Message::request(Id::Null, "mining.notify", json!(params)).encode(RpcVersion::V1),
        )
    }

    pub(crate) fn is_fake_job_id(id: &str) -> bool {
        id.is_empty() || id.starts_with('f')
    }

    /// Rewrite in place into a fresh fake job: job ids gain the `f` prefix so
    /// submissions are recognised and never forwarded, and the coinbase tail
    /// is re-tagged with the current time so miners see new work.
    pub(crate) fn to_fake(&mut self, now: u64) {
        self.params[0] = json!(format!("f{}", now % 0xffff));

        let coinbase1 = self.params[2].as_str().unwrap_or_default();
        let keep = coinbase1.len().saturating_sub(8);
        self.params[2] = json!(format!(
            "{}{}",
            &coinbase1[..keep],
            utils::u64_to_hex(now)
        ));
    }

    #[cfg(test)]
    pub(crate) fn coinbase1(&self) -> &str {
        self.params[2].as_str().unwrap_or_default()
    }

    #[cfg(test)]
    pub(crate) fn job_id(&self) -> &str {
        self.params[0].as_str().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notify_params(coinbase1: &str) -> Value {
        json!([
            "1b6e",
            "4d16b6f85af6e2198f44ae2a6de67f78487ae5611b77c6c0440b921e00000000",
            coinbase1,
            "072f736c7573682f00000000",
            [],
            "20000000",
            "1c2ac4af",
            "504e86b9",
            false
        ])
    }

    #[test]
    fn splices_session_id_into_coinbase1() {
        let job = JobBtc::from_notify(&notify_params("aa"), 0x01020304).unwrap();
        assert_eq!(job.coinbase1(), "aa01020304");
    }

    #[test]
    fn rejects_short_params() {
        assert!(JobBtc::from_notify(&json!(["only", "three", "fields"]), 1).is_err());
    }

    #[test]
    fn rejects_non_string_coinbase() {
        let mut params = notify_params("aa");
        params[2] = json!(42);
        assert!(JobBtc::from_notify(&params, 1).is_err());
    }

    #[test]
    fn notify_line_keeps_clean_flag() {
        let job = JobBtc::from_notify(&notify_params("aa"), 0).unwrap();

        let line = job.notify_line(false);
        assert!(line.ends_with('\n'));

        let message: Message = serde_json::from_str(line.trim_end()).unwrap();
        let Message::Notification { method, params, .. } = message else {
            panic!("expected notification");
        };
        assert_eq!(method, "mining.notify");
        assert_eq!(params[8], json!(false));
    }

    #[test]
    fn first_job_forces_clean() {
        let job = JobBtc::from_notify(&notify_params("aa"), 0).unwrap();
        let line = job.notify_line(true);
        let value: Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(value["params"][8], json!(true));
    }

    #[test]
    fn fake_job_rewrites_id_and_coinbase() {
        let mut job = JobBtc::from_notify(&notify_params("aabbccddeeff00112233"), 0).unwrap();
        job.to_fake(0x5f5e0f00);

        assert!(JobBtc::is_fake_job_id(job.job_id()));
        assert_eq!(job.job_id(), format!("f{}", 0x5f5e0f00u64 % 0xffff));

        // The spliced coinbase was 28 chars; the rewrite drops the last 8
        // and appends the 16-char timestamp.
        assert_eq!(job.coinbase1().len(), 36);
        assert!(job.coinbase1().ends_with(&utils::u64_to_hex(0x5f5e0f00)));
    }

    #[test]
    fn fake_job_id_detection() {
        assert!(JobBtc::is_fake_job_id("f123"));
        assert!(JobBtc::is_fake_job_id(""));
        assert!(!JobBtc::is_fake_job_id("123"));
    }
}
