// 🏦 TBC Client - SOAP over mutual TLS
//
// Two calls per account per day:
//   GetAccountStatement → opening/closing balances for the day
//   GetAccountMovements → the day's movements
// Fetching day by day keeps every movement paired with its own day's
// balances, which is what the normalizer needs for per-day groups.

use chrono::NaiveDate;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use super::{days, http_client, parse_date, BankClient};
use crate::config::TbcCredentials;
use crate::error::ClientError;
use crate::model::{
    AccountRef, Bank, Direction, RawPayload, RawTransaction, StatementBalances, TbcMovement,
};

pub const SOAP_ENV_NS: &str = "http://schemas.xmlsoap.org/soap/envelope/";
pub const MYGEMINI_NS: &str = "http://www.mygemini.com/schemas/mygemini";
pub const WSSE_NS: &str =
    "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-secext-1.0.xsd";

pub const MOVEMENTS_ACTION: &str = "http://www.mygemini.com/schemas/mygemini/GetAccountMovements";
pub const STATEMENT_ACTION: &str = "http://www.mygemini.com/schemas/mygemini/GetAccountStatement";

const MOVEMENT_RECORD: &str = "accountMovement";
const STATEMENT_RECORD: &str = "statement";

type FieldMap = BTreeMap<String, String>;

struct TbcCompany {
    credentials: TbcCredentials,
    http: reqwest::blocking::Client,
}

pub struct TbcClient {
    url: String,
    companies: HashMap<String, TbcCompany>,
}

impl TbcClient {
    /// Companies whose certificate cannot be loaded are left out; fetching
    /// their accounts then fails with `MissingCredentials`.
    pub fn new(url: &str, credentials: &HashMap<String, TbcCredentials>, timeout: Duration) -> Self {
        let mut companies = HashMap::new();

        for (company, creds) in credentials {
            let http = load_identity(creds).and_then(|id| http_client(timeout, Some(id)));
            match http {
                Ok(http) => {
                    companies.insert(
                        company.clone(),
                        TbcCompany {
                            credentials: creds.clone(),
                            http,
                        },
                    );
                }
                Err(e) => {
                    tracing::warn!(company = %company, error = %e, "TBC client certificate unusable, company skipped");
                }
            }
        }

        TbcClient {
            url: url.to_string(),
            companies,
        }
    }

    fn company(&self, name: &str) -> Result<&TbcCompany, ClientError> {
        self.companies
            .get(name)
            .ok_or_else(|| ClientError::MissingCredentials(name.to_string()))
    }

    fn call(&self, company: &TbcCompany, action: &str, body: String) -> Result<String, ClientError> {
        let response = company
            .http
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "text/xml; charset=utf-8")
            .header("SOAPAction", action)
            .body(body)
            .send()?;

        let status = response.status();
        let text = response.text()?;

        // Faults come back as HTTP 500 with a SOAP body worth reporting
        if let Some(fault) = soap_fault(&text) {
            return Err(ClientError::SoapFault(fault));
        }
        if !status.is_success() {
            return Err(ClientError::Decode(format!("HTTP {} from TBC", status)));
        }
        Ok(text)
    }

    pub fn fetch_statement(
        &self,
        account: &AccountRef,
        day: NaiveDate,
    ) -> Result<StatementBalances, ClientError> {
        let company = self.company(&account.company)?;
        let request = statement_request(&company.credentials, account, day, day)?;
        let response = self.call(company, STATEMENT_ACTION, request)?;
        parse_statement(&response)
    }

    pub fn fetch_movements(
        &self,
        account: &AccountRef,
        day: NaiveDate,
    ) -> Result<Vec<FieldMap>, ClientError> {
        let company = self.company(&account.company)?;
        let request = movements_request(&company.credentials, account, day, day)?;
        let response = self.call(company, MOVEMENTS_ACTION, request)?;
        parse_movements(&response)
    }
}

impl BankClient for TbcClient {
    fn bank(&self) -> Bank {
        Bank::Tbc
    }

    fn fetch(
        &self,
        account: &AccountRef,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<RawTransaction>, ClientError> {
        let mut records = Vec::new();

        for day in days(start, end) {
            let statement = self.fetch_statement(account, day)?;
            let movements = self.fetch_movements(account, day)?;
            tracing::debug!(account = %account.label(), date = %day, movements = movements.len(), "TBC day fetched");

            for fields in movements {
                let movement = movement_from_fields(fields, &statement);
                records.push(RawTransaction::new(
                    account.clone(),
                    RawPayload::TbcMovement(movement),
                ));
            }
        }

        Ok(records)
    }
}

/// Client certificate and unencrypted key, concatenated into one PEM identity
fn load_identity(creds: &TbcCredentials) -> Result<reqwest::Identity, ClientError> {
    let read = |path: &std::path::Path| {
        std::fs::read(path)
            .map_err(|e| ClientError::Certificate(format!("{}: {}", path.display(), e)))
    };
    let mut pem = read(&creds.certificate_path)?;
    pem.push(b'\n');
    pem.extend(read(&creds.key_path)?);

    reqwest::Identity::from_pem(&pem).map_err(|e| ClientError::Certificate(e.to_string()))
}

// ============================================================================
// REQUESTS
// ============================================================================

pub fn movements_request(
    creds: &TbcCredentials,
    account: &AccountRef,
    from: NaiveDate,
    to: NaiveDate,
) -> Result<String, ClientError> {
    envelope(creds, |w| {
        w.write_event(Event::Start(BytesStart::new("myg:GetAccountMovementsRequestIo")))?;
        w.write_event(Event::Start(BytesStart::new("myg:accountMovementFilterIo")))?;
        text_element(w, "myg:accountNumber", &account.account_number)?;
        text_element(w, "myg:accountCurrencyCode", &account.currency)?;
        text_element(
            w,
            "myg:periodFrom",
            &format!("{}T00:00:00.000", from.format("%Y-%m-%d")),
        )?;
        text_element(
            w,
            "myg:periodTo",
            &format!("{}T23:59:59.999", to.format("%Y-%m-%d")),
        )?;
        w.write_event(Event::End(BytesEnd::new("myg:accountMovementFilterIo")))?;
        w.write_event(Event::End(BytesEnd::new("myg:GetAccountMovementsRequestIo")))?;
        Ok(())
    })
}

pub fn statement_request(
    creds: &TbcCredentials,
    account: &AccountRef,
    from: NaiveDate,
    to: NaiveDate,
) -> Result<String, ClientError> {
    envelope(creds, |w| {
        w.write_event(Event::Start(BytesStart::new("myg:GetAccountStatementRequestIo")))?;
        w.write_event(Event::Start(BytesStart::new("myg:filter")))?;
        text_element(w, "myg:periodFrom", &from.format("%Y-%m-%d").to_string())?;
        text_element(w, "myg:periodTo", &to.format("%Y-%m-%d").to_string())?;
        text_element(w, "myg:accountNumber", &account.account_number)?;
        text_element(w, "myg:currency", &account.currency)?;
        w.write_event(Event::End(BytesEnd::new("myg:filter")))?;
        w.write_event(Event::End(BytesEnd::new("myg:GetAccountStatementRequestIo")))?;
        Ok(())
    })
}

/// SOAP envelope with the WS-Security username token around `body`
fn envelope<F>(creds: &TbcCredentials, body: F) -> Result<String, ClientError>
where
    F: FnOnce(&mut Writer<Vec<u8>>) -> Result<(), quick_xml::Error>,
{
    let mut w = Writer::new(Vec::new());

    w.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
    w.write_event(Event::Start(BytesStart::new("soapenv:Envelope").with_attributes([
        ("xmlns:soapenv", SOAP_ENV_NS),
        ("xmlns:myg", MYGEMINI_NS),
        ("xmlns:wsse", WSSE_NS),
    ])))?;

    w.write_event(Event::Start(BytesStart::new("soapenv:Header")))?;
    w.write_event(Event::Start(BytesStart::new("wsse:Security")))?;
    w.write_event(Event::Start(BytesStart::new("wsse:UsernameToken")))?;
    text_element(&mut w, "wsse:Username", &creds.username)?;
    text_element(&mut w, "wsse:Password", &creds.password)?;
    text_element(&mut w, "wsse:Nonce", &creds.digipass)?;
    w.write_event(Event::End(BytesEnd::new("wsse:UsernameToken")))?;
    w.write_event(Event::End(BytesEnd::new("wsse:Security")))?;
    w.write_event(Event::End(BytesEnd::new("soapenv:Header")))?;

    w.write_event(Event::Start(BytesStart::new("soapenv:Body")))?;
    body(&mut w)?;
    w.write_event(Event::End(BytesEnd::new("soapenv:Body")))?;
    w.write_event(Event::End(BytesEnd::new("soapenv:Envelope")))?;

    String::from_utf8(w.into_inner()).map_err(|e| ClientError::Xml(e.to_string()))
}

fn text_element(w: &mut Writer<Vec<u8>>, name: &str, text: &str) -> Result<(), quick_xml::Error> {
    w.write_event(Event::Start(BytesStart::new(name)))?;
    w.write_event(Event::Text(BytesText::new(text)))?;
    w.write_event(Event::End(BytesEnd::new(name)))?;
    Ok(())
}

// ============================================================================
// RESPONSES
// ============================================================================

/// Every `accountMovement` element as a flat field map
pub fn parse_movements(xml: &str) -> Result<Vec<FieldMap>, ClientError> {
    collect_records(xml, MOVEMENT_RECORD)
}

pub fn parse_statement(xml: &str) -> Result<StatementBalances, ClientError> {
    let records = collect_records(xml, STATEMENT_RECORD)?;
    let fields = records
        .into_iter()
        .next()
        .ok_or_else(|| ClientError::Decode("TBC response has no statement".to_string()))?;

    Ok(StatementBalances {
        opening_date: fields.get("openingDate").and_then(|d| parse_date(d)),
        opening_balance: number(&fields, "openingBalance"),
        closing_date: fields.get("closingDate").and_then(|d| parse_date(d)),
        closing_balance: number(&fields, "closingBalance"),
        credit_sum: number(&fields, "creditSum"),
        debit_sum: number(&fields, "debitSum"),
    })
}

/// Typed view of one movement; the full field map is kept for memo lookups
pub fn movement_from_fields(fields: FieldMap, statement: &StatementBalances) -> TbcMovement {
    TbcMovement {
        movement_id: fields.get("movementId").filter(|s| !s.is_empty()).cloned(),
        value_date: fields.get("valueDate").and_then(|d| parse_date(d)),
        amount: number(&fields, "amount"),
        direction: fields.get("debitCredit").and_then(|f| Direction::parse(f)),
        exchange_rate: fields.get("exchangeRate").filter(|s| !s.is_empty()).cloned(),
        statement: statement.clone(),
        fields,
    }
}

/// Amounts are either `<x>12.5</x>` or `<x><amount>12.5</amount>...</x>`
fn number(fields: &FieldMap, key: &str) -> Option<f64> {
    fields
        .get(&format!("{}.amount", key))
        .or_else(|| fields.get(key))
        .and_then(|v| v.trim().replace(',', ".").parse().ok())
}

/// Walk the document and flatten each `record` element into a map
///
/// Keys are local element names joined with "." below the record, so
/// namespace prefixes never matter. A SOAP Fault anywhere is an error.
fn collect_records(xml: &str, record: &str) -> Result<Vec<FieldMap>, ClientError> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut records = Vec::new();
    let mut current: Option<FieldMap> = None;
    let mut path: Vec<String> = Vec::new();
    let mut in_fault = false;
    let mut in_fault_string = false;
    let mut fault: Option<String> = None;

    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                if current.is_some() {
                    path.push(name);
                } else if name == record {
                    current = Some(FieldMap::new());
                    path.clear();
                } else if name == "Fault" {
                    in_fault = true;
                } else if in_fault && name == "faultstring" {
                    in_fault_string = true;
                }
            }
            Event::End(e) => {
                if let Some(fields) = current.as_mut() {
                    if path.pop().is_none() {
                        records.push(std::mem::take(fields));
                        current = None;
                    }
                } else if e.local_name().as_ref() == b"faultstring" {
                    in_fault_string = false;
                }
            }
            Event::Empty(e) => {
                if current.is_none() && e.local_name().as_ref() == record.as_bytes() {
                    records.push(FieldMap::new());
                }
            }
            Event::Text(t) => {
                let text = t.unescape()?.into_owned();
                if let Some(fields) = current.as_mut() {
                    if !path.is_empty() {
                        fields.insert(path.join("."), text);
                    }
                } else if in_fault_string {
                    fault = Some(text);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if in_fault {
        return Err(ClientError::SoapFault(
            fault.unwrap_or_else(|| "unspecified fault".to_string()),
        ));
    }
    Ok(records)
}

/// Fault text when the body is a SOAP Fault; None for anything else
fn soap_fault(xml: &str) -> Option<String> {
    match collect_records(xml, "") {
        Err(ClientError::SoapFault(text)) => Some(text),
        _ => None,
    }
}
