use anyhow::{Context, Result, anyhow, bail};
use chrono::NaiveDate;
use reqwest::{Client, Proxy};
use serde::{Deserialize, Serialize};
use std::{future::Future, time::Duration};

use crate::{
    common::truncate_for_log,
    constants::{
        ATTACHED_PATIENTS_EXPORT_LIST_ID, DEFAULT_REQUEST_TIMEOUT_SECONDS, DEFAULT_USER_AGENT,
        EXPORT_PATH, LOGOFF_PATH, LOGON_PATH, PERSON_SEARCH_PATH,
    },
    credentials::PooledCredential,
    model::ResolvedRecord,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupOutcome {
    Found(ResolvedRecord),
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    Authenticated,
    Closed,
}

/// One authenticated conversation with the registry.
///
/// `authenticate` errors mean the credential is unusable; `lookup` errors are
/// transport or protocol failures and leave the session dead. A registry that
/// simply has no such person answers `Ok(LookupOutcome::NotFound)`.
pub trait RegistrySession: Send {
    fn authenticate(
        &mut self,
        credential: &PooledCredential,
    ) -> impl Future<Output = Result<()>> + Send;

    fn lookup(&mut self, insurance_number: &str)
    -> impl Future<Output = Result<LookupOutcome>> + Send;

    fn close(&mut self) -> impl Future<Output = Result<()>> + Send;
}

/// Creates unauthenticated sessions, each with its own auth context.
pub trait SessionFactory: Sync {
    type Session: RegistrySession;

    fn open(&self) -> Result<Self::Session>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub address: String,
    pub port: u16,
}

impl ProxyConfig {
    pub fn url(&self) -> String {
        let address = self.address.trim_end_matches('/');
        if address.contains("://") {
            format!("{address}:{}", self.port)
        } else {
            format!("http://{address}:{}", self.port)
        }
    }
}

#[derive(Debug, Clone)]
pub struct SrzEndpoint {
    pub base_url: String,
    pub proxy: Option<ProxyConfig>,
    pub timeout: Duration,
}

impl SrzEndpoint {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.to_string(),
            proxy: None,
            timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECONDS),
        }
    }

    fn url(&self, path: &str) -> String {
        let base = self.base_url.trim_end_matches('/');
        format!("{base}/{path}")
    }

    fn build_client(&self) -> Result<Client> {
        let mut builder = Client::builder()
            .user_agent(DEFAULT_USER_AGENT)
            .cookie_store(true)
            .timeout(self.timeout);
        if let Some(proxy) = &self.proxy {
            let proxy_url = proxy.url();
            builder = builder.proxy(
                Proxy::all(&proxy_url)
                    .with_context(|| format!("Invalid proxy address {proxy_url}"))?,
            );
        }
        builder.build().context("Failed creating registry HTTP client")
    }
}

pub struct SrzSessionFactory {
    endpoint: SrzEndpoint,
}

impl SrzSessionFactory {
    /// Builds one client up front so a bad proxy or endpoint fails before any worker starts.
    pub fn new(endpoint: SrzEndpoint) -> Result<Self> {
        endpoint.build_client()?;
        Ok(Self { endpoint })
    }
}

impl SessionFactory for SrzSessionFactory {
    type Session = SrzSession;

    fn open(&self) -> Result<SrzSession> {
        SrzSession::new(self.endpoint.clone())
    }
}

/// HTTP session against the registry web portal. Auth lives in the cookie jar.
pub struct SrzSession {
    client: Client,
    endpoint: SrzEndpoint,
    state: SessionState,
    login: Option<String>,
}

impl SrzSession {
    pub fn new(endpoint: SrzEndpoint) -> Result<Self> {
        let client = endpoint.build_client()?;
        Ok(Self {
            client,
            endpoint,
            state: SessionState::Unauthenticated,
            login: None,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn login(&self) -> Option<&str> {
        self.login.as_deref()
    }

    async fn logon(&mut self, login: &str, password: &str) -> Result<()> {
        if self.state != SessionState::Unauthenticated {
            bail!("Session for {login} is not in the unauthenticated state");
        }
        let response = self
            .client
            .post(self.endpoint.url(LOGON_PATH))
            .form(&[("lg", login), ("pw", password)])
            .send()
            .await
            .with_context(|| format!("Registry logon request failed for {login}"))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .with_context(|| format!("Failed reading registry logon response for {login}"))?;
        if !status.is_success() {
            bail!(
                "Registry logon for {login} returned status {status}. Body: {}",
                truncate_for_log(&body)
            );
        }
        // The portal answers an empty body on success and an error text otherwise.
        if !body.trim().is_empty() {
            bail!(
                "Registry rejected credentials for {login}: {}",
                truncate_for_log(&body)
            );
        }
        self.state = SessionState::Authenticated;
        self.login = Some(login.to_string());
        Ok(())
    }

    async fn search_person(&mut self, insurance_number: &str) -> Result<LookupOutcome> {
        if self.state != SessionState::Authenticated {
            bail!("Lookup for {insurance_number} requires an authenticated session");
        }
        let response = self
            .client
            .post(self.endpoint.url(PERSON_SEARCH_PATH))
            .form(&[("mode", "1"), ("person_enp", insurance_number)])
            .send()
            .await
            .with_context(|| format!("Registry search request failed for {insurance_number}"))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .with_context(|| format!("Failed reading registry search for {insurance_number}"))?;
        if !status.is_success() {
            bail!(
                "Registry search for {insurance_number} returned status {status}. Body: {}",
                truncate_for_log(&body)
            );
        }
        parse_person_search(insurance_number, &body)
    }

    async fn logoff(&mut self) -> Result<()> {
        if self.state == SessionState::Closed {
            return Ok(());
        }
        let was_authenticated = self.state == SessionState::Authenticated;
        self.state = SessionState::Closed;
        if !was_authenticated {
            return Ok(());
        }
        self.client
            .get(self.endpoint.url(LOGOFF_PATH))
            .send()
            .await
            .context("Registry logoff request failed")?
            .error_for_status()
            .context("Registry logoff failed")?;
        Ok(())
    }

    /// Resolves the download link of the attached-patients export for `on_date`.
    pub async fn export_reference(&self, on_date: NaiveDate) -> Result<String> {
        if self.state != SessionState::Authenticated {
            bail!("Export request requires an authenticated session");
        }
        let date = on_date.format("%d.%m.%Y").to_string();
        let body = self
            .client
            .post(self.endpoint.url(EXPORT_PATH))
            .form(&[
                ("export_date_on", date.as_str()),
                ("exportlist_id", ATTACHED_PATIENTS_EXPORT_LIST_ID),
            ])
            .send()
            .await
            .with_context(|| format!("Registry export request failed for {date}"))?
            .error_for_status()
            .with_context(|| format!("Registry export failed for {date}"))?
            .text()
            .await
            .context("Failed reading registry export response")?;
        parse_export_reference(&body)
    }

    /// Downloads the zipped export archive for `on_date`.
    pub async fn download_export(&self, on_date: NaiveDate) -> Result<Vec<u8>> {
        let reference = self.export_reference(on_date).await?;
        let url = if reference.starts_with("http://") || reference.starts_with("https://") {
            reference
        } else {
            self.endpoint.url(reference.trim_start_matches('/'))
        };
        let bytes = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Export download request failed for {url}"))?
            .error_for_status()
            .with_context(|| format!("Export download failed for {url}"))?
            .bytes()
            .await
            .context("Failed reading export archive")?;
        Ok(bytes.to_vec())
    }
}

impl RegistrySession for SrzSession {
    async fn authenticate(&mut self, credential: &PooledCredential) -> Result<()> {
        self.logon(credential.login(), credential.password()).await
    }

    async fn lookup(&mut self, insurance_number: &str) -> Result<LookupOutcome> {
        self.search_person(insurance_number).await
    }

    async fn close(&mut self) -> Result<()> {
        self.logoff().await
    }
}

/// `status||?||enp||surname||name||patronymic||...`; status `0` means no such person.
pub fn parse_person_search(insurance_number: &str, body: &str) -> Result<LookupOutcome> {
    let fields: Vec<&str> = body.splitn(7, "||").collect();
    if fields.first().map(|f| f.trim()) == Some("0") {
        return Ok(LookupOutcome::NotFound);
    }
    if fields.len() < 6 {
        return Err(anyhow!(
            "Unexpected registry search response for {insurance_number}: {}",
            truncate_for_log(body)
        ));
    }
    let enp = match fields[2].trim() {
        "" => insurance_number,
        value => value,
    };
    let record = ResolvedRecord::new(enp, fields[3], fields[4], fields[5]);
    if record.surname.is_empty() || record.given_name.is_empty() {
        bail!(
            "Registry search for {insurance_number} returned an empty name: {}",
            truncate_for_log(body)
        );
    }
    Ok(LookupOutcome::Found(record))
}

pub fn parse_export_reference(body: &str) -> Result<String> {
    let marker = "<a href='";
    let begin = body
        .find(marker)
        .map(|idx| idx + marker.len())
        .with_context(|| {
            format!(
                "Export response has no download link: {}",
                truncate_for_log(body)
            )
        })?;
    let end = body[begin..]
        .find("' ")
        .context("Export download link is not terminated")?;
    Ok(body[begin..begin + end].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_status_is_not_found() {
        let outcome = parse_person_search("1", "0||nothing").unwrap();
        assert_eq!(outcome, LookupOutcome::NotFound);
    }

    #[test]
    fn found_response_yields_normalized_record() {
        let body = "1||77||2770260871000075||Удоенко||Сергей||Григорьевич||tail||more";
        let outcome = parse_person_search("2770260871000075", body).unwrap();
        let LookupOutcome::Found(record) = outcome else {
            panic!("expected a record");
        };
        assert_eq!(record.surname, "УДОЕНКО");
        assert_eq!(record.patronymic, "ГРИГОРЬЕВИЧ");
        assert_eq!(record.initials(), "УСГ");
    }

    #[test]
    fn short_response_is_a_protocol_failure() {
        assert!(parse_person_search("1", "<html>maintenance</html>").is_err());
    }

    #[test]
    fn export_link_is_extracted() {
        let body = "<p>ready: <a href='files/export_25.zip' target='_blank'>download</a></p>";
        assert_eq!(parse_export_reference(body).unwrap(), "files/export_25.zip");
    }

    #[test]
    fn proxy_url_gets_a_scheme() {
        let proxy = ProxyConfig {
            address: "10.0.0.5".into(),
            port: 3128,
        };
        assert_eq!(proxy.url(), "http://10.0.0.5:3128");
    }
}
