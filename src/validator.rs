/// Classifies an upstream HTTP exchange into network- and user-level success.
pub struct SuccessValidator;

const ERROR_PATTERNS: [&str; 5] = [
    "blocked",
    "forbidden",
    "access denied",
    "error 403",
    "error 404",
];

impl SuccessValidator {
    pub fn new() -> Self {
        Self
    }

    /// `network_success` is a 2xx/3xx status. `user_success` additionally
    /// requires a non-empty body whose lowercased text is free of the known
    /// block-page phrases.
    pub fn validate_http(&self, status: u16, body: &[u8]) -> (bool, bool) {
        let network_success = (200..400).contains(&status);
        if !network_success {
            return (false, false);
        }

        let user_success = if !body.is_empty() {
            let content = String::from_utf8_lossy(body).to_lowercase();
            !ERROR_PATTERNS.iter().any(|pattern| content.contains(pattern))
        } else {
            false
        };

        (network_success, user_success)
    }
}

impl Default for SuccessValidator {
    fn default() -> Self {
        Self::new()
    }
}
