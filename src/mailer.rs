use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{Message, SmtpTransport, Transport};
use rand::Rng;

use crate::config::SmtpConfig;

type MailError = Box<dyn std::error::Error + Send + Sync>;

pub struct Mailer {
    smtp: SmtpTransport,
    from: String,
}

impl Mailer {
    pub fn new(config: &SmtpConfig) -> Result<Self, MailError> {
        let creds = Credentials::new(config.user.clone(), config.password.clone());
        let tls_parameters = TlsParameters::new(config.host.clone())?;

        let smtp = SmtpTransport::relay(&config.host)?
            .credentials(creds)
            .port(465)
            .tls(Tls::Wrapper(tls_parameters))
            .build();

        Ok(Mailer {
            smtp,
            from: config.from.clone(),
        })
    }

    /// Blocking send; call from `spawn_blocking` inside async handlers.
    pub fn send_password_reset(&self, to_email: &str, reset_code: &str) -> Result<(), MailError> {
        let email = Message::builder()
            .from(format!("NutriLog <{}>", self.from).parse()?)
            .to(to_email.parse()?)
            .subject("Password Reset Request")
            .body(format!(
                "Your password reset code is: {}\nThis code will expire in 1 hour.",
                reset_code
            ))?;

        self.smtp.send(&email)?;
        Ok(())
    }
}

pub fn generate_reset_code() -> String {
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut rng = rand::thread_rng();

    (0..8)
        .map(|_| {
            let idx = rng.gen_range(0..CHARSET.len());
            CHARSET[idx] as char
        })
        .collect()
}
