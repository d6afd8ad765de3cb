//! Startup and authentication phase.
//!
//! <https://www.postgresql.org/docs/current/protocol-flow.html#PROTOCOL-FLOW-START-UP>
use super::{
    PgConn,
    auth::{self, SCRAM_SHA_256, ScramClient, UnsupportedAuth},
    conn::notice_received,
};
use crate::{
    Error, Result,
    common::{general, verbose},
    connection::Config,
    ext::BytesExt,
    postgres::{BackendMessage, DbError, ProtocolError, backend::Authentication, frontend},
};

impl PgConn {
    /// Run the startup exchange on a blocking socket.
    pub(crate) fn startup(&mut self, config: &Config) -> Result<()> {
        let mut params = vec![("client_encoding", "UTF8")];
        if let Some(name) = &config.application_name {
            params.push(("application_name", name.as_str()));
        }

        self.send_startup(frontend::Startup {
            user: &config.user,
            database: Some(config.dbname.as_str()),
            params: &params,
        });
        self.flush_blocking()?;

        self.authenticate(config)?;

        // After AuthenticationOk the backend sends ParameterStatus,
        // BackendKeyData, and finally ReadyForQuery, or an ErrorResponse.
        loop {
            use BackendMessage::*;
            match self.recv_blocking::<BackendMessage>()? {
                ReadyForQuery(ready) => {
                    self.set_tx_status(ready.tx_status);
                    break;
                },
                BackendKeyData(key) => self.set_key_data(key),
                ParameterStatus(param) => {
                    verbose!("{} = {}", param.name, param.value);
                    self.set_parameter(param.name, param.value);
                },
                NoticeResponse(notice) => notice_received(notice)?,
                ErrorResponse(err) => return Err(DbError::try_from(err)?.into()),
                NegotiateProtocolVersion(v) => {
                    log::debug!("server supports protocol minor version {}", v.minor);
                },
                f => Err(ProtocolError::unexpected_phase(f.msgtype(), "startup phase"))?,
            }
        }

        Ok(())
    }

    fn authenticate(&mut self, config: &Config) -> Result<()> {
        let mut scram = None;

        loop {
            let auth = match self.recv_blocking::<BackendMessage>()? {
                BackendMessage::Authentication(auth) => auth,
                BackendMessage::ErrorResponse(err) => return Err(DbError::try_from(err)?.into()),
                BackendMessage::NoticeResponse(notice) => {
                    notice_received(notice)?;
                    continue;
                },
                f => Err(ProtocolError::unexpected_phase(f.msgtype(), "authentication"))?,
            };

            match auth {
                Authentication::Ok => break,
                Authentication::CleartextPassword => {
                    self.send(frontend::PasswordMessage { password: &config.pass });
                },
                Authentication::MD5Password { salt } => {
                    let password = auth::md5_password(&config.user, &config.pass, salt);
                    self.send(frontend::PasswordMessage { password: &password });
                },
                Authentication::SASL { mut mechanisms } => {
                    let mut supported = false;
                    while !mechanisms.is_empty() {
                        let name = mechanisms.get_nul_bytestr()?;
                        if name.is_empty() {
                            break;
                        }
                        supported |= name == SCRAM_SHA_256;
                    }
                    if !supported {
                        return Err(UnsupportedAuth { method: "sasl without SCRAM-SHA-256" }.into());
                    }

                    let client = ScramClient::new(&config.pass);
                    self.send(frontend::SASLInitialResponse {
                        mechanism: SCRAM_SHA_256,
                        data: &client.client_first(),
                    });
                    scram = Some(client);
                },
                Authentication::SASLContinue { data } => {
                    let Some(client) = scram.as_mut() else {
                        return Err(Error::auth(general!(%"SASL continue before SASL start")));
                    };
                    let response = client.process_server_first(&data)?;
                    self.send(frontend::SASLResponse { data: &response });
                },
                Authentication::SASLFinal { data } => {
                    let Some(client) = scram.as_ref() else {
                        return Err(Error::auth(general!(%"SASL final before SASL start")));
                    };
                    client.verify_server_final(&data)?;
                    continue;
                },
                other => return Err(UnsupportedAuth { method: other.method_name() }.into()),
            }

            self.flush_blocking()?;
        }

        Ok(())
    }
}
