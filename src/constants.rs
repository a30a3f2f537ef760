pub const DEFAULT_SRZ_BASE_URL: &str = "http://11.0.0.1/";
pub const DEFAULT_USER_AGENT: &str = "patients-enricher/0.1";

pub const LOGON_PATH: &str = "data/user.ajax.logon.php";
pub const LOGOFF_PATH: &str = "?show=logoff";
pub const PERSON_SEARCH_PATH: &str = "data/reg.person.polis.search.php";
pub const EXPORT_PATH: &str = "data/dbase.export.php";
pub const ATTACHED_PATIENTS_EXPORT_LIST_ID: &str = "25";

pub const DEFAULT_THREAD_LIMIT: usize = 4;
pub const DEFAULT_REQUEST_LIMIT: usize = 1000;
pub const DEFAULT_MAX_KEY_ATTEMPTS: u32 = 2;

pub const INSURANCE_HEADER: &str = "ENP";
pub const INITIALS_HEADER: &str = "FIO";
pub const SURNAME_HEADER: &str = "Фамилия";
pub const GIVEN_NAME_HEADER: &str = "Имя";
pub const PATRONYMIC_HEADER: &str = "Отчество";
pub const IMPORT_INSURANCE_HEADER: &str = "Полис";
pub const DEFAULT_REQUEST_TIMEOUT_SECONDS: u64 = 30;

pub const DEFAULT_SETTINGS_PATH: &str = "settings.json";
pub const DEFAULT_CACHE_DB: &str = "data/patients_cache.sqlite";
pub const DEFAULT_PATIENTS_FILE: &str = "data/patients.csv";
pub const DEFAULT_IMPORT_EXAMPLE: &str = "import_example.csv";
